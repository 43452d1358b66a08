//! A MapReduce-compatible implementation of word count.
//!

use anyhow::{anyhow, Result};
use common::{MapOutput, Record};
use serde_json::Value;

pub fn map(input: Record, _aux: &[String]) -> MapOutput {
    let text = input
        .value
        .as_str()
        .ok_or_else(|| anyhow!("split `{}` is not text", input.key))?;

    let words = text
        .split(|c: char| !c.is_alphabetic())
        .filter(|s| !s.is_empty())
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>();

    let iter = words.into_iter().map(|word| Ok(Record::new(word, 1)));
    Ok(Box::new(iter))
}

pub fn reduce(key: &str, values: Box<dyn Iterator<Item = Value> + '_>, _aux: &[String]) -> Result<Value> {
    let mut count = 0u64;
    for value in values {
        count += value
            .as_u64()
            .ok_or_else(|| anyhow!("count for `{key}` is not a number: {value}"))?;
    }
    Ok(Value::from(count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_words_case_insensitively() {
        let input = Record::new("s1", "The cat and the hat.");
        let records = map(input, &[])
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();

        let keys: Vec<&str> = records.iter().map(Record::key).collect();
        assert_eq!(keys, ["the", "cat", "and", "the", "hat"]);

        let total = reduce("the", Box::new(vec![Value::from(1), Value::from(1)].into_iter()), &[]).unwrap();
        assert_eq!(total, Value::from(2));
    }

    #[test]
    fn rejects_non_text_splits() {
        assert!(map(Record::new("s1", 5), &[]).is_err());
    }
}
