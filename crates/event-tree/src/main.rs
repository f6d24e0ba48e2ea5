#![forbid(unsafe_code)]
//! Read-only diagnostic: render the lifecycle event tree of an autonous
//! ledger, as box-drawing text or JSON. Defaults to the subtree of the
//! most recent supervisor `process.started` event.

use autonous_storage::{EventRow, EventTree, Store};
use serde_json::{json, Value};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

const TS_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

#[derive(Debug)]
struct Args {
    db_path: String,
    event_id: Option<i64>,
    max_depth: usize,
    json_out: bool,
    no_payload: bool,
}

fn usage() -> &'static str {
    "autonous-event-tree — render the lifecycle event tree\n\n\
USAGE:\n\
  autonous-event-tree [--db PATH] [--id EVENT_ID] [-L DEPTH] [--json] [--no-payload]\n\n\
NOTES:\n\
  - default root: the latest supervisor process.started event\n\
  - -L 0 means unlimited depth\n\
  - the database is opened read-only\n"
}

fn parse_args(argv: &[String]) -> Result<Args, String> {
    let mut args = Args {
        db_path: std::env::var("AUTONOUS_DB_PATH").unwrap_or_else(|_| "./autonous.db".to_string()),
        event_id: None,
        max_depth: 0,
        json_out: false,
        no_payload: false,
    };
    let mut iter = argv.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--db" => {
                args.db_path = iter
                    .next()
                    .ok_or_else(|| "--db requires a value".to_string())?
                    .clone();
            }
            "--id" => {
                let raw = iter.next().ok_or_else(|| "--id requires a value".to_string())?;
                args.event_id =
                    Some(raw.parse::<i64>().map_err(|_| format!("invalid --id: {raw}"))?);
            }
            "-L" => {
                let raw = iter.next().ok_or_else(|| "-L requires a value".to_string())?;
                args.max_depth = raw.parse::<usize>().map_err(|_| format!("invalid -L: {raw}"))?;
            }
            "--json" => args.json_out = true,
            "--no-payload" => args.no_payload = true,
            "--help" | "-h" => return Err(usage().to_string()),
            other => return Err(format!("unknown flag: {other}\n\n{}", usage())),
        }
    }
    Ok(args)
}

fn main() {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(2);
        }
    };
    if let Err(err) = run(&args) {
        eprintln!("[event-tree] {err}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let store = Store::open_read_only(&args.db_path)?;

    let root_id = match args.event_id {
        Some(id) => id,
        None => store
            .latest_supervisor_root()?
            .ok_or("no supervisor process.started event found")?,
    };

    let events = store.subtree(root_id)?;
    let tree = Store::build_tree(events, root_id).ok_or("root event not found")?;

    if args.json_out {
        let value = to_json_event(&tree, root_id, 1, args.max_depth, args.no_payload);
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        let mut out = String::new();
        render_tree(&tree, root_id, "", true, 1, args.max_depth, args.no_payload, &mut out);
        print!("{out}");
    }
    Ok(())
}

/// Render one node and its children with box-drawing connectors.
#[allow(clippy::too_many_arguments)]
fn render_tree(
    tree: &EventTree,
    id: i64,
    prefix: &str,
    is_last: bool,
    depth: usize,
    max_depth: usize,
    no_payload: bool,
    out: &mut String,
) {
    let Some(event) = tree.events.get(&id) else {
        return;
    };
    let line = format_event(event, no_payload);
    if depth == 1 {
        out.push_str(&line);
        out.push('\n');
    } else {
        let connector = if is_last { "└── " } else { "├── " };
        out.push_str(prefix);
        out.push_str(connector);
        out.push_str(&line);
        out.push('\n');
    }

    let children = tree.children_of(id);
    if max_depth > 0 && depth >= max_depth {
        if !children.is_empty() {
            let child_prefix = child_prefix(prefix, is_last, depth);
            out.push_str(&child_prefix);
            out.push_str("└── [...]\n");
        }
        return;
    }

    let child_prefix = child_prefix(prefix, is_last, depth);
    for (index, child_id) in children.iter().enumerate() {
        let last_child = index == children.len() - 1;
        render_tree(
            tree,
            *child_id,
            &child_prefix,
            last_child,
            depth + 1,
            max_depth,
            no_payload,
            out,
        );
    }
}

fn child_prefix(prefix: &str, is_last: bool, depth: usize) -> String {
    if depth <= 1 {
        return prefix.to_string();
    }
    if is_last {
        format!("{prefix}    ")
    } else {
        format!("{prefix}│   ")
    }
}

/// One line per event: `[id] timestamp  event_type  key=value ...` with
/// payload keys sorted for stable output.
fn format_event(event: &EventRow, no_payload: bool) -> String {
    let ts = OffsetDateTime::from_unix_timestamp(event.timestamp)
        .ok()
        .and_then(|t| t.format(TS_FORMAT).ok())
        .unwrap_or_else(|| event.timestamp.to_string());
    let mut line = format!("[{}] {}  {}", event.id, ts, event.event_type);

    if !no_payload {
        if let Some(Value::Object(map)) = event.payload_value() {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                line.push_str(&format!("  {key}={}", format_value(&map[key])));
            }
        }
    }
    line
}

fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => {
            if s.chars().count() > 80 {
                let head: String = s.chars().take(80).collect();
                format!("{:?}", format!("{head}..."))
            } else {
                s.clone()
            }
        }
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn to_json_event(
    tree: &EventTree,
    id: i64,
    depth: usize,
    max_depth: usize,
    no_payload: bool,
) -> Value {
    let Some(event) = tree.events.get(&id) else {
        return Value::Null;
    };
    let mut out = json!({
        "id": event.id,
        "timestamp": event.timestamp,
        "event_type": event.event_type,
    });
    if !no_payload {
        if let Some(payload) = event.payload_value() {
            out["payload"] = payload;
        }
    }
    if max_depth > 0 && depth >= max_depth {
        return out;
    }
    let children: Vec<Value> = tree
        .children_of(id)
        .iter()
        .map(|child| to_json_event(tree, *child, depth + 1, max_depth, no_payload))
        .collect();
    if !children.is_empty() {
        out["children"] = Value::Array(children);
    }
    out
}
