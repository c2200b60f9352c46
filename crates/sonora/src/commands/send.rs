use serde_json::Value;

use sonora_api::Command;

use crate::cli::{GlobalOpts, SendArgs};
use crate::error::CliError;

pub async fn handle(args: SendArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let data = parse_data(args.data.as_deref())?;
    let config = super::load_config(global)?;
    let connection = super::connection(&config.client.connection_config()?)?;
    let printer = super::printer(global);

    connection.start().await?;
    let command = Command::new(args.kind, data);
    let result = if args.no_wait {
        connection.command(&command).await.map(|id| printer.print(&id))
    } else {
        connection
            .execute(&command)
            .await
            .map(|outcome| printer.print(&printer.render_outcome(&outcome)))
    };
    connection.stop().await;
    result.map_err(CliError::from)
}

fn parse_data(raw: Option<&str>) -> Result<Value, CliError> {
    let Some(raw) = raw else {
        return Ok(Value::Object(serde_json::Map::new()));
    };
    let value: Value = serde_json::from_str(raw)?;
    if !value.is_object() {
        return Err(CliError::Validation {
            field: "--data".into(),
            reason: "expected a JSON object".into(),
        });
    }
    Ok(value)
}
