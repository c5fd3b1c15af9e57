use tidepool_core::Session;

use crate::error::CliError;
use crate::output::{self, OutputOpts};

pub async fn handle(session: &Session, out: OutputOpts) -> Result<(), CliError> {
    let models = session.list_models().await?;
    out.print(&output::render_value(out.format, &models));
    Ok(())
}
