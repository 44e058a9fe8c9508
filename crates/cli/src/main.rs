use std::process::ExitCode;

fn main() -> ExitCode {
    match quotedesk_cli::run() {
        Ok(code) => code,
        Err(error) => {
            eprintln!("quotedesk: {error:#}");
            ExitCode::from(1)
        }
    }
}
