use clap::Parser;
use sqlflow::cmd::{dispatch, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    std::process::exit(dispatch(cli).await);
}
