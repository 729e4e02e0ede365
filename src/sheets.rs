use crate::error::AppError;
use crate::types::{AppState, CandidateContext};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";

/// Candidate rows start at sheet row 2; row 1 is the header.
const CANDIDATE_RANGE: &str = "candidates!A2:P";

const COL_NAME: usize = 1;
const COL_PHONE: usize = 2;
const COL_EMAIL: usize = 3;
const COL_TITLE: usize = 5;
const COL_STATUS: usize = 8;
const COL_INTERVIEWER: usize = 11;
const COL_SLOTS: usize = 12;

const STATUS_TO_CALL: &str = "To Call";

#[derive(Deserialize, Debug, Default)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

#[derive(Serialize)]
struct WriteRange {
    range: String,
    values: Vec<Vec<String>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchUpdateRequest {
    value_input_option: &'static str,
    data: Vec<WriteRange>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct BatchUpdateResponse {
    #[serde(default)]
    total_updated_cells: u32,
}

fn cell(row: &[String], col: usize) -> &str {
    row.get(col).map(String::as_str).unwrap_or("").trim()
}

fn plausible_email(email: &str) -> bool {
    !email.is_empty() && email.contains('@')
}

/// Scan the sheet top to bottom for the first dialable row still marked
/// "To Call". Rows missing a phone number or carrying malformed emails are
/// skipped with a warning so one bad row never stalls the queue.
pub async fn find_candidate_to_call(
    app_state: &Arc<AppState>,
) -> Result<Option<CandidateContext>, AppError> {
    let token = app_state.google_token(&[SHEETS_SCOPE]).await?;
    let url = format!(
        "https://sheets.googleapis.com/v4/spreadsheets/{}/values/{}",
        app_state.sheet_id, CANDIDATE_RANGE,
    );
    let range = app_state
        .http_client
        .get(&url)
        .bearer_auth(&token)
        .send()
        .await
        .map_err(|e| {
            error!(error=%e, "sheet read request failed");
            AppError("sheet read request error")
        })?
        .error_for_status()
        .map_err(|e| {
            error!(error=%e, "sheet read rejected");
            AppError("sheet read rejected")
        })?
        .json::<ValueRange>()
        .await
        .map_err(|e| {
            error!(error=%e, "failed to deserialize sheet values");
            AppError("sheet values deserialize error")
        })?;

    for (index, row) in range.values.iter().enumerate() {
        let row_number = (index + 2) as u32;
        if cell(row, COL_STATUS) != STATUS_TO_CALL {
            continue;
        }
        let phone = cell(row, COL_PHONE);
        if phone.is_empty() {
            warn!(row = row_number, "skipping callable row with no phone number");
            continue;
        }
        let email = cell(row, COL_EMAIL);
        let interviewer = cell(row, COL_INTERVIEWER);
        if !plausible_email(email) || !plausible_email(interviewer) {
            warn!(row = row_number, "skipping callable row with malformed emails");
            continue;
        }
        let candidate = CandidateContext {
            name: cell(row, COL_NAME).to_string(),
            phone: phone.to_string(),
            email: email.to_string(),
            title: cell(row, COL_TITLE).to_string(),
            row_index: Some(row_number),
            interviewer_email: interviewer.to_string(),
            available_slots: cell(row, COL_SLOTS).to_string(),
        };
        info!(row = row_number, name=%candidate.name, "found candidate to call");
        return Ok(Some(candidate));
    }
    debug!("no rows marked for calling");
    Ok(None)
}

/// Write the outcome back onto the candidate's row: status in column I,
/// notes in column J, and the scheduled time in column N when a slot was
/// agreed.
pub async fn update_sheet_status(
    app_state: &Arc<AppState>,
    row_index: u32,
    status: &str,
    notes: &str,
    scheduled_time: Option<&str>,
) -> Result<(), AppError> {
    let token = app_state.google_token(&[SHEETS_SCOPE]).await?;
    let mut data = vec![
        WriteRange {
            range: format!("candidates!I{row_index}"),
            values: vec![vec![status.to_string()]],
        },
        WriteRange {
            range: format!("candidates!J{row_index}"),
            values: vec![vec![notes.to_string()]],
        },
    ];
    if let Some(time) = scheduled_time {
        data.push(WriteRange {
            range: format!("candidates!N{row_index}"),
            values: vec![vec![time.to_string()]],
        });
    }
    let url = format!(
        "https://sheets.googleapis.com/v4/spreadsheets/{}/values:batchUpdate",
        app_state.sheet_id,
    );
    let resp = app_state
        .http_client
        .post(&url)
        .bearer_auth(&token)
        .json(&BatchUpdateRequest {
            value_input_option: "USER_ENTERED",
            data,
        })
        .send()
        .await
        .map_err(|e| {
            error!(row = row_index, error=%e, "sheet update request failed");
            AppError("sheet update request error")
        })?
        .error_for_status()
        .map_err(|e| {
            error!(row = row_index, error=%e, "sheet update rejected");
            AppError("sheet update rejected")
        })?
        .json::<BatchUpdateResponse>()
        .await
        .unwrap_or_default();
    info!(row = row_index, status=%status, updated_cells = resp.total_updated_cells, "sheet row updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_tolerates_ragged_rows() {
        let row = vec!["id".to_string(), " Asha Rao ".to_string()];
        assert_eq!(cell(&row, COL_NAME), "Asha Rao");
        assert_eq!(cell(&row, COL_SLOTS), "");
    }

    #[test]
    fn batch_update_serializes_ranges() {
        let req = BatchUpdateRequest {
            value_input_option: "USER_ENTERED",
            data: vec![WriteRange {
                range: "candidates!I7".to_string(),
                values: vec![vec!["Scheduled".to_string()]],
            }],
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"valueInputOption\":\"USER_ENTERED\""));
        assert!(json.contains("candidates!I7"));
    }

    #[test]
    fn value_range_defaults_when_sheet_is_empty() {
        let range: ValueRange = serde_json::from_str(r#"{"range": "candidates!A2:P"}"#).unwrap();
        assert!(range.values.is_empty());
    }
}
