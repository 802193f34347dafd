mod cli;

use clap::Parser;
use cli::Cli;
use metering_engine::error::ErrorKind;

fn main() {
    let cli = Cli::parse();

    if let Err(e) = cli::run(cli) {
        eprintln!("Error: {}", e);
        // Bad input is the caller's to fix; anything else may be retried
        let code = match e.kind() {
            ErrorKind::MalformedInput | ErrorKind::NotFound | ErrorKind::Stale => 2,
            _ => 1,
        };
        std::process::exit(code);
    }
}
