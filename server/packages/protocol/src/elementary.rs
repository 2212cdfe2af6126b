/// Splits a pushed compressed-video byte stream into units.
///
/// A unit is the span between two start codes (`00 00 01`, optionally
/// preceded by more zero bytes). Zero runs leading into a start code are not
/// part of the preceding unit, and bytes before the first start code are
/// dropped. Chunk boundaries may fall anywhere, including inside a start code.
#[derive(Debug, Default)]
pub struct ElementaryStreamReassembler {
    buffer: Vec<u8>,
    unit_start: Option<usize>,
    scan_from: usize,
}

impl ElementaryStreamReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one delivery and returns every unit it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);

        let mut units = Vec::new();
        let mut i = self.scan_from;
        while i + 3 <= self.buffer.len() {
            let window = &self.buffer[i..i + 3];
            if window == [0, 0, 1] {
                if let Some(start) = self.unit_start {
                    if let Some(unit) = trimmed(&self.buffer[start..i]) {
                        units.push(unit);
                    }
                }
                i += 3;
                self.unit_start = Some(i);
            } else if window[2] > 1 {
                // no start code can begin at i, i + 1 or i + 2
                i += 3;
            } else {
                i += 1;
            }
        }
        self.scan_from = i;
        self.compact();
        units
    }

    /// Flushes the trailing partial unit once the stream has closed.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let unit = self
            .unit_start
            .and_then(|start| trimmed(&self.buffer[start..]));
        self.buffer.clear();
        self.unit_start = None;
        self.scan_from = 0;
        unit
    }

    /// Bytes currently held back waiting for the next start code.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    fn compact(&mut self) {
        let keep_from = self.unit_start.unwrap_or(self.scan_from);
        if keep_from == 0 {
            return;
        }
        self.buffer.drain(..keep_from);
        self.scan_from -= keep_from;
        if let Some(start) = self.unit_start.as_mut() {
            *start -= keep_from;
        }
    }
}

fn trimmed(span: &[u8]) -> Option<Vec<u8>> {
    let end = span.iter().rposition(|b| *b != 0)? + 1;
    Some(span[..end].to_vec())
}
