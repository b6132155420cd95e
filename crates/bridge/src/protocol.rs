//! Push-channel message types.
//!
//! Every message on `/ws` is a JSON object `{"op": <tag>, "data": <payload>}`.
//! Messages are decoded into the closed [`Operation`] enum; tags we don't
//! know land in [`Operation::Unknown`] with their payload intact so that
//! protocol drift shows up in the logs instead of vanishing.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope of every push-channel message.
#[derive(Debug, Clone, Deserialize)]
pub struct RawMessage {
    pub op: String,
    #[serde(default)]
    pub data: Value,
}

/// Status of a cell as reported in `cell-op`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CellStatus {
    Queued,
    Running,
    Idle,
    DisabledTransitively,
    #[serde(other)]
    Other,
}

/// One output payload: a mimetype-tagged blob on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellOutput {
    pub channel: String,
    pub mimetype: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

/// Channel the server uses for errors raised by a cell.
pub const ERROR_CHANNEL: &str = "marimo-error";

impl CellOutput {
    pub fn is_error(&self) -> bool {
        self.channel == ERROR_CHANNEL
    }
}

/// `console` arrives as a single output, a list of them, or null.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Console {
    Many(Vec<CellOutput>),
    One(CellOutput),
}

impl Console {
    pub fn into_vec(self) -> Vec<CellOutput> {
        match self {
            Console::Many(outputs) => outputs,
            Console::One(output) => vec![output],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct KernelReady {
    pub cell_ids: Vec<String>,
    pub codes: Vec<String>,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub resumed: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CellOp {
    pub cell_id: String,
    #[serde(default)]
    pub status: Option<CellStatus>,
    #[serde(default)]
    pub output: Option<CellOutput>,
    #[serde(default)]
    pub console: Option<Console>,
    #[serde(default)]
    pub timestamp: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallStatus {
    pub state: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallResult {
    pub function_call_id: String,
    #[serde(default)]
    pub return_value: Value,
    pub status: FunctionCallStatus,
}

impl FunctionCallResult {
    pub fn is_error(&self) -> bool {
        self.status.state == "error"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingPackageAlert {
    pub packages: Vec<String>,
    #[serde(default)]
    pub isolated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallingPackageAlert {
    /// Package name to install status (`queued`, `installing`, `installed`, `failed`).
    pub packages: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelStartupError {
    pub error: String,
}

/// A decoded push-channel message.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    KernelReady(KernelReady),
    CellOp(CellOp),
    FunctionCallResult(FunctionCallResult),
    CompletedRun,
    Interrupted,
    Alert(Alert),
    Banner(Alert),
    MissingPackageAlert(MissingPackageAlert),
    InstallingPackageAlert(InstallingPackageAlert),
    Reconnected,
    Reload,
    KernelStartupError(KernelStartupError),

    // Relayed to the UI without interpretation.
    Variables(Value),
    VariableValues(Value),
    Datasets(Value),
    RemoveUiElements(Value),
    SendUiElementMessage(Value),
    UpdateCellCodes(Value),
    UpdateCellIds(Value),
    FocusCell(Value),
    CompletionResult(Value),
    QueryParamsSet(Value),
    QueryParamsAppend(Value),
    QueryParamsDelete(Value),
    QueryParamsClear(Value),

    Unknown { op: String, data: Value },
}

fn payload<T: DeserializeOwned>(data: Value) -> Result<T, serde_json::Error> {
    serde_json::from_value(data)
}

impl Operation {
    /// Decode one text frame.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        let raw: RawMessage = serde_json::from_str(text)?;
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawMessage) -> Result<Self, serde_json::Error> {
        let RawMessage { op, data } = raw;
        Ok(match op.as_str() {
            "kernel-ready" => Operation::KernelReady(payload(data)?),
            "cell-op" => Operation::CellOp(payload(data)?),
            "function-call-result" => Operation::FunctionCallResult(payload(data)?),
            "completed-run" => Operation::CompletedRun,
            "interrupted" => Operation::Interrupted,
            "alert" => Operation::Alert(payload(data)?),
            "banner" => Operation::Banner(payload(data)?),
            "missing-package-alert" => Operation::MissingPackageAlert(payload(data)?),
            "installing-package-alert" => Operation::InstallingPackageAlert(payload(data)?),
            "reconnected" => Operation::Reconnected,
            "reload" => Operation::Reload,
            "kernel-startup-error" => Operation::KernelStartupError(payload(data)?),
            "variables" => Operation::Variables(data),
            "variable-values" => Operation::VariableValues(data),
            "datasets" => Operation::Datasets(data),
            "remove-ui-elements" => Operation::RemoveUiElements(data),
            "send-ui-element-message" => Operation::SendUiElementMessage(data),
            "update-cell-codes" => Operation::UpdateCellCodes(data),
            "update-cell-ids" => Operation::UpdateCellIds(data),
            "focus-cell" => Operation::FocusCell(data),
            "completion-result" => Operation::CompletionResult(data),
            "query-params-set" => Operation::QueryParamsSet(data),
            "query-params-append" => Operation::QueryParamsAppend(data),
            "query-params-delete" => Operation::QueryParamsDelete(data),
            "query-params-clear" => Operation::QueryParamsClear(data),
            other => Operation::Unknown {
                op: other.to_string(),
                data,
            },
        })
    }

    /// The wire tag of this operation.
    pub fn name(&self) -> &str {
        match self {
            Operation::KernelReady(_) => "kernel-ready",
            Operation::CellOp(_) => "cell-op",
            Operation::FunctionCallResult(_) => "function-call-result",
            Operation::CompletedRun => "completed-run",
            Operation::Interrupted => "interrupted",
            Operation::Alert(_) => "alert",
            Operation::Banner(_) => "banner",
            Operation::MissingPackageAlert(_) => "missing-package-alert",
            Operation::InstallingPackageAlert(_) => "installing-package-alert",
            Operation::Reconnected => "reconnected",
            Operation::Reload => "reload",
            Operation::KernelStartupError(_) => "kernel-startup-error",
            Operation::Variables(_) => "variables",
            Operation::VariableValues(_) => "variable-values",
            Operation::Datasets(_) => "datasets",
            Operation::RemoveUiElements(_) => "remove-ui-elements",
            Operation::SendUiElementMessage(_) => "send-ui-element-message",
            Operation::UpdateCellCodes(_) => "update-cell-codes",
            Operation::UpdateCellIds(_) => "update-cell-ids",
            Operation::FocusCell(_) => "focus-cell",
            Operation::CompletionResult(_) => "completion-result",
            Operation::QueryParamsSet(_) => "query-params-set",
            Operation::QueryParamsAppend(_) => "query-params-append",
            Operation::QueryParamsDelete(_) => "query-params-delete",
            Operation::QueryParamsClear(_) => "query-params-clear",
            Operation::Unknown { op, .. } => op,
        }
    }
}
