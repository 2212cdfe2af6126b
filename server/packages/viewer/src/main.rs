fn main() {
    if let Err(err) = render_gateway_viewer::cli::run_viewer() {
        tracing::error!(error = %err, "render-gateway-viewer failed");
        std::process::exit(1);
    }
}
