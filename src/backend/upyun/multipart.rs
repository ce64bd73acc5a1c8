use async_trait::async_trait;
use reqwest::{header::HeaderMap, Body, Method, Response, StatusCode};
use snafu::ResultExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::{Error, RequestSnafu, Upyun};
use crate::{BoxError, Chunk, Initiated, MultipartUploader, PartAck, PartRequest, Stage};

const MULTI_STAGE: &str = "X-Upyun-Multi-Stage";
const MULTI_LENGTH: &str = "X-Upyun-Multi-Length";
const MULTI_TYPE: &str = "X-Upyun-Multi-Type";
const MULTI_UUID: &str = "X-Upyun-Multi-UUID";
const PART_ID: &str = "X-Upyun-Part-ID";

const RESP_UUID: &str = "x-upyun-multi-uuid";
const RESP_NEXT_PART_SIZE: &str = "x-upyun-next-part-size";
const RESP_NEXT_PART_ID: &str = "x-upyun-next-part-id";

#[async_trait]
impl MultipartUploader for Upyun {
    async fn initiate(
        &self,
        dest: &str,
        length: Option<u64>,
        content_type: Option<&str>,
    ) -> Result<Initiated, BoxError> {
        debug!("Initiating multipart upload to upyun: {}", dest);
        let mut request = self
            .client
            .request(Method::PUT, dest)
            .header(MULTI_STAGE, "initiate")
            .header("Content-Length", 0);
        if let Some(length) = length {
            request = request.header(MULTI_LENGTH, length);
        }
        if let Some(content_type) = content_type {
            request = request.header(MULTI_TYPE, content_type);
        }

        let response = request
            .send()
            .await
            .context(RequestSnafu { stage: "initiate" })?;
        let response = expect_status(response, "initiate", &[StatusCode::NO_CONTENT]).await?;

        Ok(parse_initiated(response.headers()))
    }

    async fn upload_part(
        &self,
        dest: &str,
        part: PartRequest<'_>,
        chunk: Chunk,
    ) -> Result<PartAck, BoxError> {
        debug!(
            "Uploading part {} of {} to upyun ({} bytes)",
            part.part_id, dest, chunk.len
        );
        let mut request = self
            .client
            .request(Method::PUT, dest)
            .header(MULTI_STAGE, part.stage.as_str())
            .header(PART_ID, part.part_id)
            .header("Content-Length", chunk.len);
        if let Some(size) = part.part_size {
            request = request.header(MULTI_LENGTH, size);
        }
        if let Some(token) = part.token {
            request = request.header(MULTI_UUID, token);
        }

        let body = Body::wrap_stream(ReaderStream::new(chunk.reader));
        let response = request
            .body(body)
            .send()
            .await
            .context(RequestSnafu {
                stage: part.stage.as_str(),
            })?;
        let response =
            expect_status(response, part.stage.as_str(), part_statuses(part.stage)).await?;

        Ok(parse_part_ack(response.headers()))
    }

    async fn complete(&self, dest: &str, token: Option<&str>) -> Result<(), BoxError> {
        debug!("Completing multipart upload to upyun: {}", dest);
        let mut request = self
            .client
            .request(Method::PUT, dest)
            .header(MULTI_STAGE, "complete")
            .header("Content-Length", 0);
        if let Some(token) = token {
            request = request.header(MULTI_UUID, token);
        }

        let response = request
            .send()
            .await
            .context(RequestSnafu { stage: "complete" })?;
        expect_status(
            response,
            "complete",
            &[StatusCode::NO_CONTENT, StatusCode::CREATED],
        )
        .await?;

        Ok(())
    }
}

async fn expect_status(
    response: Response,
    stage: &'static str,
    accepted: &[StatusCode],
) -> Result<Response, Error> {
    let status = response.status();
    if accepted.contains(&status) {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Status {
        stage,
        status: status.as_u16(),
        body,
    })
}

/// A part sent with the complete stage may also finish with 201.
fn part_statuses(stage: Stage) -> &'static [StatusCode] {
    match stage {
        Stage::Upload => &[StatusCode::NO_CONTENT],
        Stage::Complete => &[StatusCode::NO_CONTENT, StatusCode::CREATED],
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    header_str(headers, name).and_then(|v| v.parse().ok())
}

fn parse_initiated(headers: &HeaderMap) -> Initiated {
    Initiated {
        token: header_str(headers, RESP_UUID).map(str::to_string),
        next_part_size: header_u64(headers, RESP_NEXT_PART_SIZE),
    }
}

/// A missing next part id, or the `-1` sentinel, means no more parts.
fn parse_part_ack(headers: &HeaderMap) -> PartAck {
    let next_part_id = header_str(headers, RESP_NEXT_PART_ID)
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|id| *id >= 0)
        .map(|id| id as u64);
    PartAck {
        next_part_id,
        next_part_size: header_u64(headers, RESP_NEXT_PART_SIZE),
    }
}
