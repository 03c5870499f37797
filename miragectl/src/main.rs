use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = miragectl::Cli::parse();
    if let Err(err) = miragectl::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
