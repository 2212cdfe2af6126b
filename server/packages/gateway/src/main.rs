fn main() {
    if let Err(err) = render_gateway::cli::run_gateway() {
        tracing::error!(error = %err, "render-gateway failed");
        std::process::exit(1);
    }
}
