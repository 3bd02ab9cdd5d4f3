#[tokio::main]
async fn main() {
    jdm_translate::init_tracing();

    if let Err(e) = jdm_translate::run(std::env::args().skip(1).collect()).await {
        tracing::error!(error = %e, "jdm-translate failed");
        eprintln!("{e}");
        std::process::exit(1);
    }
}
