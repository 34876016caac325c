/// CLI module - command-line interface for the sync engine
mod cli;

fn main() {
    cli::run();
}
