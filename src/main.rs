use std::process::exit;

use scanline::parser::worker::run_worker_loop;
use scanline::parser::WORKER_FLAG;

fn main() {
    if std::env::args().any(|a| a == WORKER_FLAG) {
        let stdin = std::io::stdin();
        let stdout = std::io::stdout();
        if let Err(e) = run_worker_loop(stdin.lock(), stdout.lock()) {
            eprintln!("parser worker: {e}");
            exit(1);
        }
        return;
    }

    if let Err(e) = scanline::app::run_cli() {
        eprintln!("{e}");
        exit(1);
    }
}
