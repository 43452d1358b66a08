//! A MapReduce-compatible application that computes the
//! degree of each vertex in a graph, given a list of edges.
//!

use anyhow::{anyhow, Result};
use common::{MapOutput, Record};
use serde_json::Value;

fn parse_line(line: &str) -> Result<(u64, u64)> {
    let mut iter = line.split_whitespace().take(2);
    let a = iter
        .next()
        .ok_or_else(|| anyhow!("Invalid input file format"))?
        .parse()?;
    let b = iter
        .next()
        .ok_or_else(|| anyhow!("Invalid input file format"))?
        .parse()?;
    Ok((a, b))
}

pub fn map(input: Record, _aux: &[String]) -> MapOutput {
    let text = input
        .value
        .as_str()
        .ok_or_else(|| anyhow!("split `{}` is not text", input.key))?;
    let edges = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_line)
        .collect::<Result<Vec<_>>>()?;

    let iter = edges.into_iter().flat_map(move |(a, b)| {
        [
            Ok(Record::new(a.to_string(), 1)),
            Ok(Record::new(b.to_string(), 1)),
        ]
    });
    Ok(Box::new(iter))
}

pub fn reduce(key: &str, values: Box<dyn Iterator<Item = Value> + '_>, _aux: &[String]) -> Result<Value> {
    let mut count = 0u64;

    for value in values {
        count += value
            .as_u64()
            .ok_or_else(|| anyhow!("degree contribution is not a number: {value}"))?;
    }

    Ok(Value::from(format!("{key}, deg={count}")))
}
