//! A MapReduce-compatible implementation of `grep`.
//!
//! Takes `--term <TERM>` as its auxiliary arguments and reports every line
//! of every split containing the term, keyed by split.

use anyhow::{anyhow, Result};
use clap::Parser;
use common::{MapOutput, Record};
use serde_json::{json, Value};

#[derive(Parser, Debug)]
#[clap(no_binary_name = true)]
struct Args {
    #[clap(short, long, value_parser)]
    term: String,
}

pub fn map(input: Record, aux: &[String]) -> MapOutput {
    let args = Args::try_parse_from(aux)?;
    let term = args.term;

    let text = input
        .value
        .as_str()
        .ok_or_else(|| anyhow!("split `{}` is not text", input.key))?;
    let lines = text
        .lines()
        .enumerate()
        .filter(|(_, s)| s.contains(&term))
        .map(|(i, s)| (i + 1, s.to_string()))
        .collect::<Vec<_>>();

    let split = input.key;
    let iter = lines
        .into_iter()
        .map(move |(line_num, line)| Ok(Record::new(split.clone(), json!([line_num, line]))));
    Ok(Box::new(iter))
}

pub fn reduce(key: &str, values: Box<dyn Iterator<Item = Value> + '_>, _aux: &[String]) -> Result<Value> {
    let mut matches = values
        .map(|value| serde_json::from_value::<(u64, String)>(value).map_err(anyhow::Error::from))
        .collect::<Result<Vec<_>>>()?;
    matches.sort_by_key(|(line_num, _)| *line_num);

    let mut out = String::new();
    for (line_num, line) in matches {
        out.push_str(&format!("{key}:{line_num}:: {line}\n"));
    }
    Ok(Value::from(out))
}
