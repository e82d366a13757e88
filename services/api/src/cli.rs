use crate::demo::{run_demo, run_verify_permit, DemoArgs, VerifyPermitArgs};
use crate::server;
use clap::{Args, Parser, Subcommand};
use krg_evisit::error::AppError;

#[derive(Parser, Debug)]
#[command(
    name = "KRG e-Visit",
    about = "Run and exercise the visitor e-permit service from the command line",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service (default command)
    Serve(ServeArgs),
    /// Walk an application from submission through checkpoint entry and overstay sweep
    Demo(DemoArgs),
    /// Check a scanned permit QR payload against the configured signing key
    VerifyPermit(VerifyPermitArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Demo(args) => run_demo(args),
        Command::VerifyPermit(args) => run_verify_permit(args),
    }
}
