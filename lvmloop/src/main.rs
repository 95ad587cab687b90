use clap::Parser;
use lvmloop::cli::Cli;
use lvmloop::ProvisionError;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();
    lvmloop::logging::init(cli.verbose, cli.log_file.as_deref());

    match lvmloop::run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<ProvisionError>() {
                Some(e) => eprintln!("error: [{}] {}", e.stage(), e),
                None => eprintln!("error: {err:#}"),
            }
            ExitCode::from(lvmloop::exit_code_for(&err))
        }
    }
}
