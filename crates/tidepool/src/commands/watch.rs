//! `tidepool watch`: execute a live query and print its changes.

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info};

use tidepool_core::{LiveEvent, QueryDescriptor, Session};

use super::parse_json;
use crate::cli::WatchArgs;
use crate::error::CliError;
use crate::output::{self, OutputOpts};

/// Translate watch flags into a validated live query descriptor.
pub fn build_query(args: &WatchArgs) -> Result<QueryDescriptor, CliError> {
    let query = match args.raw {
        Some(ref raw) => QueryDescriptor::from_json(parse_json("--raw", raw)?)?,
        None => {
            let conditions = match args.query {
                Some(ref text) => parse_json("--query", text)?,
                None => json!({}),
            };
            let mut builder = if args.find_one {
                QueryDescriptor::builder().find_one(conditions)
            } else {
                QueryDescriptor::builder().find(conditions)
            };
            if let Some(ref spec) = args.sort {
                builder = builder.sort(spec.clone());
            }
            if let Some(n) = args.skip {
                builder = builder.skip(n);
            }
            if let Some(n) = args.limit {
                builder = builder.limit(n);
            }
            if let Some(ref fields) = args.select {
                builder = builder.select(fields.clone());
            }
            if let Some(ref path) = args.populate {
                builder = builder.populate(path.clone());
            }
            if args.count {
                builder = builder.count();
            }
            if let Some(ref field) = args.distinct {
                builder = builder.distinct(field.clone());
            }
            builder.build()?
        }
    };

    query.classification().check_live()?;
    Ok(query)
}

pub async fn handle(
    session: &Session,
    args: &WatchArgs,
    query: QueryDescriptor,
    out: OutputOpts,
) -> Result<(), CliError> {
    let model = session.model(&args.model);
    let candidate = model.live_query(query);

    let (tx, mut events) = mpsc::unbounded_channel::<LiveEvent>();
    let subscription = candidate.on_any(move |_, event| {
        let _ = tx.send(event.clone());
    });

    let live = candidate.exec().await?;
    info!(model = %args.model, handle = ?live.handle(), "watching live query");

    if args.once {
        out.print(&output::render_result(out.format, &live.result()));
    } else {
        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    debug!("interrupted");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => out.print(&output::render_event(out.format, &event, out.color)),
                    None => break,
                },
            }
        }
    }

    subscription.unsubscribe();
    live.stop().await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use clap::Parser;
    use tidepool_core::{QueryError, QueryShape};

    use crate::cli::{Cli, Command};

    fn watch_args(argv: &[&str]) -> WatchArgs {
        let cli = Cli::try_parse_from(["tidepool", "watch"].iter().chain(argv)).unwrap();
        match cli.command {
            Command::Watch(args) => args,
            other => panic!("expected watch, got {other:?}"),
        }
    }

    #[test]
    fn flags_build_a_limited_sorted_list() {
        let query = build_query(&watch_args(&[
            "task",
            "--query",
            r#"{"done": false}"#,
            "--sort",
            "-created",
            "--limit",
            "10",
        ]))
        .unwrap();

        assert_eq!(query.shape(), QueryShape::List);
        assert_eq!(query.classification().limit(), Some(10));
        assert_eq!(
            query.to_wire(),
            json!([
                {"method": "find", "args": [{"done": false}]},
                {"method": "sort", "args": ["-created"]},
                {"method": "limit", "args": [10]},
            ])
        );
    }

    #[test]
    fn count_with_sort_is_rejected() {
        let err = build_query(&watch_args(&["task", "--count", "--sort", "title"])).unwrap_err();
        assert!(matches!(err, CliError::Query(QueryError::CountWithSort)));
    }

    #[test]
    fn raw_query_is_validated() {
        let query =
            build_query(&watch_args(&["task", "--raw", r#"[{"method":"distinct","args":["tag"]}]"#]))
                .unwrap();
        assert_eq!(query.shape(), QueryShape::Distinct);

        let err = build_query(&watch_args(&["task", "--raw", r#"[{"method":"explode"}]"#]))
            .unwrap_err();
        assert!(matches!(err, CliError::Query(QueryError::UnknownMethod(_))));

        let err = build_query(&watch_args(&["task", "--query", "{nope"])).unwrap_err();
        assert!(matches!(err, CliError::Json { .. }));
    }

    #[test]
    fn find_one_without_conditions() {
        let query = build_query(&watch_args(&["task", "--find-one"])).unwrap();
        assert_eq!(query.shape(), QueryShape::FindOne);
        assert_eq!(query.calls()[0].args, vec![Value::Object(serde_json::Map::new())]);
    }
}
