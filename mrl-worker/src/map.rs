use anyhow::{anyhow, bail, Error};
use tracing::{debug, info};
use url::Url;

use common::job::{JobSpec, MapStatus};
use common::message::{MapOutputChunk, Message, Upload};
use common::Record;

/// Records per `UPL mapOutput` message.
pub const CHUNK_RECORDS: usize = 512;

/// Get the text of a split, inline or over HTTP.
pub async fn read_split(status: &MapStatus, http: &reqwest::Client) -> Result<String, Error> {
    if let Some(input) = &status.input {
        return Ok(input.clone());
    }

    let Some(url) = &status.url else {
        bail!("split `{}` has neither input nor url", status.split_id);
    };
    let url = Url::parse(url).map_err(|e| anyhow!("bad url for split `{}`: {e}", status.split_id))?;

    debug!("downloading split `{}` from {url}", status.split_id);
    let text = http.get(url).send().await?.error_for_status()?.text().await?;
    Ok(text)
}

/// Run the job's map function over `text` and hand the output to `emit` as
/// `UPL mapOutput` messages. The last message always has `more: false`, even
/// when the map function produced nothing.
///
/// Returns the number of records produced.
pub fn perform_map(
    job: &JobSpec,
    split_id: &str,
    text: String,
    mut emit: impl FnMut(Message) -> Result<(), Error>,
) -> Result<usize, Error> {
    info!("Starting map task for job {} split `{split_id}` with workload `{}`", job.job_id, job.workload);

    let workload = workload::named(&job.workload)?;

    let input = Record::new(split_id, text);
    let output = (workload.map_fn)(input, job.aux())?;

    let upload = |records: Vec<Record>, more: bool| {
        Message::Upload(Upload::MapOutput(MapOutputChunk {
            job_id: job.job_id,
            split_id: split_id.to_string(),
            records,
            more,
        }))
    };

    let mut total = 0;
    let mut chunk = Vec::with_capacity(CHUNK_RECORDS);
    for record in output {
        chunk.push(record?);
        total += 1;

        if chunk.len() == CHUNK_RECORDS {
            let full = std::mem::replace(&mut chunk, Vec::with_capacity(CHUNK_RECORDS));
            emit(upload(full, true))?;
        }
    }
    emit(upload(chunk, false))?;

    debug!("split `{split_id}` produced {total} records");
    Ok(total)
}
