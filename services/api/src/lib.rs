mod cli;
mod demo;
mod infra;
mod routes;
mod server;

use krg_evisit::error::AppError;

pub async fn run() -> Result<(), AppError> {
    cli::run().await
}
