//! Read-only run queries plus run deletion.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use traced_proto::prelude::{
    DiffResult, FunctionStats, RunDetail, RunFilter, RunId, RunStatus, RunSummary, Timestamp,
};

use super::error::{ApiResult, RequestError};
use super::AppState;

const METADATA_PREFIX: &str = "meta.";

/// Builds a filter from query parameters. `meta.<key>=<value>` pairs
/// constrain run metadata; timestamps are nanoseconds since the epoch.
pub fn parse_filter(params: &HashMap<String, String>) -> Result<RunFilter, RequestError> {
    let invalid = |key: &str, value: &str| RequestError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    };

    let mut filter = RunFilter::new();
    for (key, value) in params {
        match key.as_str() {
            "name" => filter.name = Some(value.clone()),
            "status" => {
                filter.status = Some(
                    value
                        .parse::<RunStatus>()
                        .map_err(|_| invalid(key, value))?,
                )
            }
            "limit" => filter.limit = Some(value.parse().map_err(|_| invalid(key, value))?),
            "started_after" => {
                filter.started_after =
                    Some(Timestamp(value.parse().map_err(|_| invalid(key, value))?))
            }
            "started_before" => {
                filter.started_before =
                    Some(Timestamp(value.parse().map_err(|_| invalid(key, value))?))
            }
            "tags" => filter.tags.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|tag| !tag.is_empty())
                    .map(str::to_string),
            ),
            other => match other.strip_prefix(METADATA_PREFIX) {
                Some(meta) if !meta.is_empty() => {
                    filter.metadata.insert(meta.to_string(), value.clone());
                }
                _ => log::debug!("ignoring unknown run filter parameter `{other}`"),
            },
        }
    }
    Ok(filter)
}

pub async fn list_runs(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Vec<RunSummary>>> {
    let filter = parse_filter(&params)?;
    Ok(Json(state.query.list_runs(&filter).await?))
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RunDetail>> {
    let id: RunId = id.parse()?;
    Ok(Json(state.query.get_run(id).await?))
}

pub async fn run_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<FunctionStats>>> {
    let id: RunId = id.parse()?;
    Ok(Json(state.query.run_stats(id).await?))
}

pub async fn delete_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let id: RunId = id.parse()?;
    state.query.delete_run(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
pub struct DiffParams {
    /// Relative duration change above which a matched span is reported.
    pub threshold: Option<f64>,
}

pub async fn diff_runs(
    State(state): State<AppState>,
    Path((a, b)): Path<(String, String)>,
    Query(params): Query<DiffParams>,
) -> ApiResult<Json<DiffResult>> {
    let a: RunId = a.parse()?;
    let b: RunId = b.parse()?;
    Ok(Json(state.query.diff_runs(a, b, params.threshold).await?))
}

pub async fn get_blob(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Vec<u8>> {
    Ok(state.query.load_blob(&key).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_filter() {
        let filter = parse_filter(&params(&[
            ("name", "baseline"),
            ("status", "completed"),
            ("limit", "10"),
            ("meta.git_commit", "abc123"),
            ("started_after", "5"),
            ("tags", "nightly, gpu,"),
        ]))
        .unwrap();
        assert_eq!(filter.name.as_deref(), Some("baseline"));
        assert_eq!(filter.status, Some(RunStatus::Completed));
        assert_eq!(filter.limit, Some(10));
        assert_eq!(filter.started_after, Some(Timestamp(5)));
        assert_eq!(filter.metadata.get("git_commit").map(String::as_str), Some("abc123"));
        assert_eq!(filter.tags, vec!["nightly", "gpu"]);
    }

    #[test]
    fn test_parse_filter_rejects_bad_values() {
        assert!(parse_filter(&params(&[("limit", "ten")])).is_err());
        assert!(parse_filter(&params(&[("status", "paused")])).is_err());
        assert!(parse_filter(&params(&[("unrelated", "x")])).is_ok());
    }
}
