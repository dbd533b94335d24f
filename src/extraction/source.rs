use super::synthesis::DataSource;
use crate::sandbox::DataFormat;
use rand::Rng;
use serde_json::Value;
use std::collections::BTreeSet;
use thiserror::Error;

/// Rows kept from each end of the payload; up to as many again from the middle.
const EDGE_ROWS: usize = 5;
const MIDDLE_ROWS: usize = 5;
/// Plain text gets a longer head since its structure is unknown.
const TEXT_HEAD_ROWS: usize = 10;
/// Fingerprint marker for pasted text, so it never shares programs with CSV
/// files that happen to have the same first line.
const TEXT_MARKER: &str = "__text__";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("payload is empty")]
    Empty,
    #[error("payload is not valid JSON: {0}")]
    Json(String),
}

/// Best guess at a payload's format when the caller did not say.
pub fn sniff_format(payload: &str) -> DataFormat {
    let trimmed = payload.trim_start();
    if (trimmed.starts_with('[') || trimmed.starts_with('{'))
        && serde_json::from_str::<Value>(payload).is_ok()
    {
        return DataFormat::Json;
    }
    let header = trimmed.lines().next().unwrap_or_default();
    if split_fields(header).len() > 1 && trimmed.lines().nth(1).is_some() {
        DataFormat::Csv
    } else {
        DataFormat::Text
    }
}

pub fn format_for_filename(name: &str) -> Option<DataFormat> {
    let ext = name.rsplit_once('.')?.1.to_ascii_lowercase();
    match ext.as_str() {
        "csv" | "tsv" => Some(DataFormat::Csv),
        "json" => Some(DataFormat::Json),
        "txt" | "md" => Some(DataFormat::Text),
        _ => None,
    }
}

/// Cuts a representative sample out of the payload: first rows, last rows
/// and a few random ones from the middle.
pub fn build_source<R: Rng + ?Sized>(
    format: DataFormat,
    payload: String,
    image_filenames: Vec<String>,
    context: Option<String>,
    rng: &mut R,
) -> Result<DataSource, SourceError> {
    if payload.trim().is_empty() {
        return Err(SourceError::Empty);
    }
    let (headers, sample, total_rows) = match format {
        DataFormat::Csv => csv_sample(&payload, rng),
        DataFormat::Json => json_sample(&payload, rng)?,
        DataFormat::Text => text_sample(&payload, rng),
    };
    Ok(DataSource {
        format,
        headers,
        sample,
        full: payload,
        total_rows,
        image_filenames,
        context,
    })
}

fn csv_sample<R: Rng + ?Sized>(payload: &str, rng: &mut R) -> (Vec<String>, String, usize) {
    let records = csv_records(payload);
    let Some((header, rows)) = records.split_first() else {
        return (Vec::new(), String::new(), 0);
    };
    let headers = split_fields(header);
    let picked = pick_rows(rows.len(), EDGE_ROWS, rng);
    let mut sample = String::from(*header);
    for index in picked {
        sample.push('\n');
        sample.push_str(rows[index]);
    }
    (headers, sample, rows.len())
}

fn json_sample<R: Rng + ?Sized>(
    payload: &str,
    rng: &mut R,
) -> Result<(Vec<String>, String, usize), SourceError> {
    let parsed: Value =
        serde_json::from_str(payload).map_err(|err| SourceError::Json(err.to_string()))?;
    let rows = json_rows(&parsed);

    let headers: BTreeSet<String> = rows
        .iter()
        .filter_map(|row| row.as_object())
        .flat_map(|object| object.keys().cloned())
        .collect();
    let picked: Vec<Value> = pick_rows(rows.len(), EDGE_ROWS, rng)
        .into_iter()
        .map(|index| rows[index].clone())
        .collect();
    let sample = serde_json::to_string_pretty(&picked).unwrap_or_default();
    Ok((headers.into_iter().collect(), sample, rows.len()))
}

/// The list of records inside a JSON document: the document itself when it
/// is an array, otherwise the first array of objects under a common key.
fn json_rows(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(rows) => rows.iter().collect(),
        Value::Object(object) => {
            let preferred = ["products", "items", "data", "records", "results"]
                .iter()
                .filter_map(|key| object.get(*key));
            let any = object.values();
            preferred
                .chain(any)
                .find_map(|candidate| match candidate {
                    Value::Array(rows) if rows.iter().any(Value::is_object) => {
                        Some(rows.iter().collect())
                    }
                    _ => None,
                })
                .unwrap_or_else(|| vec![value])
        }
        _ => Vec::new(),
    }
}

fn text_sample<R: Rng + ?Sized>(payload: &str, rng: &mut R) -> (Vec<String>, String, usize) {
    let lines: Vec<&str> = payload
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect();
    let sample = if lines.len() <= TEXT_HEAD_ROWS + EDGE_ROWS + MIDDLE_ROWS {
        lines.join("\n")
    } else {
        let mut picked: Vec<usize> = (0..TEXT_HEAD_ROWS).collect();
        let middle = pick_middle(TEXT_HEAD_ROWS, lines.len() - EDGE_ROWS, rng);
        picked.extend(middle);
        picked.extend(lines.len() - EDGE_ROWS..lines.len());
        picked.iter().map(|&i| lines[i]).collect::<Vec<_>>().join("\n")
    };

    let mut headers = vec![TEXT_MARKER.to_string()];
    if let Some(first) = lines.first() {
        headers.extend(split_fields(first));
    }
    (headers, sample, text_records(payload))
}

/// Pasted products are either one per line or blocks separated by blank lines.
fn text_records(payload: &str) -> usize {
    let blocks = payload
        .split("\n\n")
        .filter(|block| !block.trim().is_empty())
        .count();
    if blocks > 1 {
        blocks
    } else {
        payload.lines().filter(|line| !line.trim().is_empty()).count()
    }
}

/// Indices of the first and last `edge` rows plus a random handful between.
fn pick_rows<R: Rng + ?Sized>(len: usize, edge: usize, rng: &mut R) -> Vec<usize> {
    if len <= edge * 2 + MIDDLE_ROWS {
        return (0..len).collect();
    }
    let mut picked: Vec<usize> = (0..edge).collect();
    picked.extend(pick_middle(edge, len - edge, rng));
    picked.extend(len - edge..len);
    picked
}

fn pick_middle<R: Rng + ?Sized>(start: usize, end: usize, rng: &mut R) -> Vec<usize> {
    let pool = end.saturating_sub(start);
    let mut chosen: Vec<usize> = rand::seq::index::sample(rng, pool, MIDDLE_ROWS.min(pool))
        .into_iter()
        .map(|offset| start + offset)
        .collect();
    chosen.sort_unstable();
    chosen
}

/// Splits CSV text into records, keeping quoted newlines inside their field.
fn csv_records(payload: &str) -> Vec<&str> {
    let mut records = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (index, ch) in payload.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '\n' if !in_quotes => {
                let record = payload[start..index].trim_end_matches('\r');
                if !record.trim().is_empty() {
                    records.push(record);
                }
                start = index + 1;
            }
            _ => {}
        }
    }
    let tail = payload[start..].trim_end_matches('\r');
    if !tail.trim().is_empty() {
        records.push(tail);
    }
    records
}

/// Header names from one delimited line. Tabs win when there are no commas.
fn split_fields(line: &str) -> Vec<String> {
    let delimiter = if !line.contains(',') && line.contains('\t') {
        '\t'
    } else {
        ','
    };
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in line.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            c if c == delimiter && !in_quotes => fields.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    fields.push(current);
    fields
        .into_iter()
        .map(|field| field.trim().to_string())
        .filter(|field| !field.is_empty())
        .collect()
}
