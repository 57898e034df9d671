//! Wire message model: the envelope exchanged on the bus, the typed
//! parameter layer on top of it, and the builders for every outbound shape.

use std::fmt;

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::shared::{HalError, HalResult};

/// Action names understood on the wire.
pub mod action {
    pub const GET_PARAMETERS: &str = "getParameters";
    pub const GET_PARAMETERS_RESPONSE: &str = "getParametersResponse";
    pub const SET_PARAMETERS: &str = "setParameters";
    pub const DELETE_OBJECT: &str = "deleteObject";
    pub const GET_SCHEMA: &str = "getSchema";
    pub const GET_SCHEMA_RESPONSE: &str = "getSchemaResponse";
    pub const SUBSCRIBE_EVENT: &str = "subscribeEvent";
    pub const PUBLISH_EVENT: &str = "publishEvent";
    pub const RESULT: &str = "result";
}

/// Reply status carried in `Result.Status`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    Success,
    Failed,
    NotSupported,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Success => "Success",
            Status::Failed => "Failed",
            Status::NotSupported => "Not Supported",
        }
    }

    pub fn parse(raw: &str) -> Option<Status> {
        match raw {
            "Success" => Some(Status::Success),
            "Failed" => Some(Status::Failed),
            "Not Supported" => Some(Status::NotSupported),
            _ => None,
        }
    }
}

/// How a subscriber wants to be notified.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NotificationMode {
    OnChange,
    OnChangeSync,
    OnChangeSyncTimeout,
}

impl NotificationMode {
    pub fn parse(raw: &str) -> Option<NotificationMode> {
        match raw {
            "onChange" => Some(NotificationMode::OnChange),
            "onChangeSync" => Some(NotificationMode::OnChangeSync),
            "onChangeSyncTimeout" => Some(NotificationMode::OnChangeSyncTimeout),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NotificationMode::OnChange => "onChange",
            NotificationMode::OnChangeSync => "onChangeSync",
            NotificationMode::OnChangeSyncTimeout => "onChangeSyncTimeout",
        }
    }

    /// The publisher blocks on the subscriber's acknowledgement.
    pub fn is_synchronous(self) -> bool {
        self != NotificationMode::OnChange
    }
}

/// Request identifier as it appears on the wire. The client mints zero-padded
/// hex strings, the server mints decimal numbers for events; correlation is
/// by the canonical string form, so both sides treat the id as opaque.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(untagged)]
pub enum ReqId {
    Text(String),
    Number(u64),
}

impl ReqId {
    pub fn canonical(&self) -> String {
        match self {
            ReqId::Text(text) => text.clone(),
            ReqId::Number(number) => number.to_string(),
        }
    }
}

impl fmt::Display for ReqId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReqId::Text(text) => f.write_str(text),
            ReqId::Number(number) => write!(f, "{}", number),
        }
    }
}

/// Closed set of wire parameter types.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParamType {
    #[serde(rename = "string")]
    String,
    #[serde(rename = "int")]
    Int,
    #[serde(rename = "boolean")]
    Boolean,
    #[serde(rename = "long")]
    Long,
    #[serde(rename = "unsignedInt")]
    UnsignedInt,
    #[serde(rename = "unsignedLong")]
    UnsignedLong,
    #[serde(rename = "hexBinary")]
    HexBinary,
    #[serde(rename = "base64")]
    Base64,
}

/// One entry of the `params` array.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Param {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub param_type: Option<ParamType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(rename = "notificationType", default, skip_serializing_if = "Option::is_none")]
    pub notification_type: Option<String>,
}

impl Param {
    pub fn named(name: &str) -> Param {
        Param {
            name: name.to_owned(),
            param_type: None,
            value: None,
            notification_type: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ResultField {
    #[serde(rename = "Status", default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct SchemaInfo {
    #[serde(rename = "FilePath", default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

/// The top-level JSON object exchanged on the wire. Inbound messages missing
/// header fields still decode; the routing layers decide what to drop.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Envelope {
    #[serde(default)]
    pub module: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(rename = "reqId", default, skip_serializing_if = "Option::is_none")]
    pub req_id: Option<ReqId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<Param>>,
    #[serde(rename = "Result", default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultField>,
    #[serde(rename = "SchemaInfo", default, skip_serializing_if = "Option::is_none")]
    pub schema_info: Option<SchemaInfo>,
}

impl Envelope {
    pub fn from_slice(bytes: &[u8]) -> HalResult<Envelope> {
        serde_json::from_slice(bytes).map_err(|err| HalError::Parse {
            offset: err.column().saturating_sub(1),
            byte: None,
        })
    }

    pub fn from_value(value: &Value) -> HalResult<Envelope> {
        serde_json::from_value(value.clone()).map_err(|err| HalError::Parse {
            offset: err.column().saturating_sub(1),
            byte: None,
        })
    }

    /// Serialized wire form. The peer frames on JSON structure, so the pretty
    /// rendering (matching the historical sender) is safe.
    pub fn to_wire(&self) -> Vec<u8> {
        serde_json::to_string_pretty(self)
            .expect("envelope serialization cannot fail")
            .into_bytes()
    }

    pub fn action(&self) -> Option<&str> {
        self.action.as_ref().map(String::as_str)
    }

    pub fn req_id(&self) -> Option<&ReqId> {
        self.req_id.as_ref()
    }

    pub fn param_count(&self) -> usize {
        self.params.as_ref().map_or(0, Vec::len)
    }

    pub fn first_param(&self) -> Option<&Param> {
        self.params.as_ref().and_then(|params| params.first())
    }
}

/// Header for a fresh client request. Every action except `getSchema` gets
/// an empty `params` array for the caller to fill.
pub fn request_header(module: &str, version: &str, action_name: &str, sequence: u32) -> Envelope {
    let params = if action_name == action::GET_SCHEMA {
        None
    } else {
        Some(Vec::new())
    };

    Envelope {
        module: module.to_owned(),
        version: version.to_owned(),
        action: Some(action_name.to_owned()),
        req_id: Some(ReqId::Text(format!("{:08X}", sequence))),
        params,
        result: None,
        schema_info: None,
    }
}

/// Reply skeleton handed to an action handler. `getParameters` replies carry
/// an empty `params` array, `getSchema` replies an empty `SchemaInfo`, and
/// everything else an empty `Result`.
pub fn reply_skeleton(module: &str, version: &str, action_name: &str, req_id: &ReqId) -> Envelope {
    let mut reply = Envelope {
        module: module.to_owned(),
        version: version.to_owned(),
        action: None,
        req_id: Some(req_id.clone()),
        params: None,
        result: None,
        schema_info: None,
    };

    if action_name == action::GET_PARAMETERS {
        reply.action = Some(action::GET_PARAMETERS_RESPONSE.to_owned());
        reply.params = Some(Vec::new());
    } else if action_name == action::GET_SCHEMA {
        reply.action = Some(action::GET_SCHEMA_RESPONSE.to_owned());
        reply.schema_info = Some(SchemaInfo::default());
    } else {
        reply.action = Some(action::RESULT.to_owned());
        reply.result = Some(ResultField::default());
    }

    reply
}

/// Status-only `result` reply (used for Failed / Not Supported conversions).
pub fn status_reply(module: &str, version: &str, req_id: &ReqId, status: Status) -> Envelope {
    Envelope {
        module: module.to_owned(),
        version: version.to_owned(),
        action: Some(action::RESULT.to_owned()),
        req_id: Some(req_id.clone()),
        params: None,
        result: Some(ResultField {
            status: Some(status.as_str().to_owned()),
        }),
        schema_info: None,
    }
}

/// Event envelope sent to one subscriber. The id goes out as a decimal JSON
/// number, preserving the historical wire form.
pub fn event_envelope(
    module: &str,
    version: &str,
    sequence: u32,
    event_name: &str,
    event_value: &str,
) -> Envelope {
    let mut param = Param::named(event_name);
    param.value = Some(Value::String(event_value.to_owned()));

    Envelope {
        module: module.to_owned(),
        version: version.to_owned(),
        action: Some(action::PUBLISH_EVENT.to_owned()),
        req_id: Some(ReqId::Number(u64::from(sequence))),
        params: Some(vec![param]),
        result: None,
        schema_info: None,
    }
}

/// Client-side acknowledgement for a synchronous event; echoes the event id
/// as a string.
pub fn event_ack(
    module: &str,
    version: &str,
    req_id: &ReqId,
    event_name: &str,
    status: Status,
) -> Envelope {
    Envelope {
        module: module.to_owned(),
        version: version.to_owned(),
        action: Some(action::RESULT.to_owned()),
        req_id: Some(ReqId::Text(req_id.canonical())),
        params: Some(vec![Param::named(event_name)]),
        result: Some(ResultField {
            status: Some(status.as_str().to_owned()),
        }),
        schema_info: None,
    }
}

/// A parameter with its value decoded per its wire type.
#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue {
    Boolean(bool),
    Int(i32),
    UnsignedInt(u32),
    Long(i64),
    UnsignedLong(u64),
    Str(String),
    HexBinary(String),
    Base64(String),
}

impl ParamValue {
    pub fn wire_type(&self) -> ParamType {
        match self {
            ParamValue::Boolean(_) => ParamType::Boolean,
            ParamValue::Int(_) => ParamType::Int,
            ParamValue::UnsignedInt(_) => ParamType::UnsignedInt,
            ParamValue::Long(_) => ParamType::Long,
            ParamValue::UnsignedLong(_) => ParamType::UnsignedLong,
            ParamValue::Str(_) => ParamType::String,
            ParamValue::HexBinary(_) => ParamType::HexBinary,
            ParamValue::Base64(_) => ParamType::Base64,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            ParamValue::Boolean(value) => Value::Bool(*value),
            ParamValue::Int(value) => Value::from(*value),
            ParamValue::UnsignedInt(value) => Value::from(*value),
            ParamValue::Long(value) => Value::from(*value),
            ParamValue::UnsignedLong(value) => Value::from(*value),
            ParamValue::Str(value) | ParamValue::HexBinary(value) | ParamValue::Base64(value) => {
                Value::String(value.clone())
            }
        }
    }

    fn from_wire(param_type: ParamType, value: &Value) -> HalResult<ParamValue> {
        let mismatch = HalError::InvalidArgument("parameter value does not match its type");
        match param_type {
            ParamType::Boolean => value.as_bool().map(ParamValue::Boolean).ok_or(mismatch),
            ParamType::Int => value.as_i64().map(|v| ParamValue::Int(v as i32)).ok_or(mismatch),
            ParamType::UnsignedInt => value
                .as_u64()
                .map(|v| ParamValue::UnsignedInt(v as u32))
                .ok_or(mismatch),
            ParamType::Long => value.as_i64().map(ParamValue::Long).ok_or(mismatch),
            ParamType::UnsignedLong => value.as_u64().map(ParamValue::UnsignedLong).ok_or(mismatch),
            ParamType::String => value
                .as_str()
                .map(|v| ParamValue::Str(v.to_owned()))
                .ok_or(mismatch),
            ParamType::HexBinary => value
                .as_str()
                .map(|v| ParamValue::HexBinary(v.to_owned()))
                .ok_or(mismatch),
            ParamType::Base64 => value
                .as_str()
                .map(|v| ParamValue::Base64(v.to_owned()))
                .ok_or(mismatch),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HalParam {
    pub name: String,
    pub value: ParamValue,
}

impl HalParam {
    pub fn new(name: &str, value: ParamValue) -> HalParam {
        HalParam {
            name: name.to_owned(),
            value,
        }
    }
}

fn param_at(envelope: &Envelope, index: usize) -> HalResult<&Param> {
    envelope
        .params
        .as_ref()
        .and_then(|params| params.get(index))
        .ok_or(HalError::InvalidArgument("no parameter at index"))
}

/// Number of entries in the `params` array.
pub fn param_count(envelope: &Envelope) -> usize {
    envelope.param_count()
}

/// Name of the parameter at `index` (get/delete requests carry names only).
pub fn param_name(envelope: &Envelope, index: usize) -> HalResult<&str> {
    Ok(&param_at(envelope, index)?.name)
}

/// Decodes the parameter at `index` with its declared type (set requests and
/// get responses).
pub fn typed_param(envelope: &Envelope, index: usize) -> HalResult<HalParam> {
    let param = param_at(envelope, index)?;
    let param_type = param
        .param_type
        .ok_or(HalError::InvalidArgument("parameter has no type"))?;
    let value = param
        .value
        .as_ref()
        .ok_or(HalError::InvalidArgument("parameter has no value"))?;

    Ok(HalParam {
        name: param.name.clone(),
        value: ParamValue::from_wire(param_type, value)?,
    })
}

/// Appends a typed parameter to the envelope's `params` array.
pub fn push_param(envelope: &mut Envelope, param: HalParam) -> HalResult<()> {
    let params = envelope
        .params
        .as_mut()
        .ok_or(HalError::InvalidArgument("envelope has no params array"))?;

    params.push(Param {
        name: param.name,
        param_type: Some(param.value.wire_type()),
        value: Some(param.value.to_json()),
        notification_type: None,
    });
    Ok(())
}

/// Appends a name-only parameter (get/delete requests).
pub fn push_param_name(envelope: &mut Envelope, name: &str) -> HalResult<()> {
    let params = envelope
        .params
        .as_mut()
        .ok_or(HalError::InvalidArgument("envelope has no params array"))?;

    params.push(Param::named(name));
    Ok(())
}

/// Decoded `subscribeEvent` request entry. `mode` is `None` for an unknown
/// notification string; the caller decides the fallback (and warns).
#[derive(Clone, Debug, PartialEq)]
pub struct SubscribeRequest {
    pub name: String,
    pub mode: Option<NotificationMode>,
    pub raw_mode: String,
}

pub fn subscribe_request(envelope: &Envelope, index: usize) -> HalResult<SubscribeRequest> {
    let param = param_at(envelope, index)?;
    let raw_mode = param
        .notification_type
        .clone()
        .ok_or(HalError::InvalidArgument("subscription has no notificationType"))?;

    Ok(SubscribeRequest {
        name: param.name.clone(),
        mode: NotificationMode::parse(&raw_mode),
        raw_mode,
    })
}

/// Overwrites the reply's `Result` with the given status.
pub fn set_result_status(envelope: &mut Envelope, status: Status) {
    envelope.result = Some(ResultField {
        status: Some(status.as_str().to_owned()),
    });
}

/// Status carried in the envelope's `Result`, if it is one of the known
/// strings.
pub fn result_status(envelope: &Envelope) -> Option<Status> {
    envelope
        .result
        .as_ref()
        .and_then(|result| result.status.as_ref())
        .and_then(|status| Status::parse(status))
}

/// Fills the `SchemaInfo.FilePath` of a `getSchema` reply.
pub fn set_schema_path(envelope: &mut Envelope, path: &str) -> HalResult<()> {
    let info = envelope
        .schema_info
        .as_mut()
        .ok_or(HalError::InvalidArgument("reply has no SchemaInfo"))?;

    info.file_path = Some(path.to_owned());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_header_format() {
        let request = request_header("DSLHAL", "0.2", action::SET_PARAMETERS, 1001);

        assert_eq!(request.module, "DSLHAL");
        assert_eq!(request.version, "0.2");
        assert_eq!(request.action(), Some(action::SET_PARAMETERS));
        assert_eq!(request.req_id, Some(ReqId::Text("000003E9".to_owned())));
        assert_eq!(request.params, Some(Vec::new()));
        assert_eq!(request.result, None);
    }

    #[test]
    fn test_request_header_get_schema_has_no_params() {
        let request = request_header("DSLHAL", "0.2", action::GET_SCHEMA, 101);

        assert_eq!(request.params, None);
    }

    #[test]
    fn test_reply_skeleton_shapes() {
        let req_id = ReqId::Text("000000FF".to_owned());

        let get = reply_skeleton("m", "1", action::GET_PARAMETERS, &req_id);
        assert_eq!(get.action(), Some(action::GET_PARAMETERS_RESPONSE));
        assert_eq!(get.params, Some(Vec::new()));
        assert_eq!(get.result, None);

        let schema = reply_skeleton("m", "1", action::GET_SCHEMA, &req_id);
        assert_eq!(schema.action(), Some(action::GET_SCHEMA_RESPONSE));
        assert_eq!(schema.schema_info, Some(SchemaInfo::default()));

        let set = reply_skeleton("m", "1", action::SET_PARAMETERS, &req_id);
        assert_eq!(set.action(), Some(action::RESULT));
        assert_eq!(set.result, Some(ResultField::default()));
    }

    #[test]
    fn test_envelope_wire_roundtrip() {
        let mut request = request_header("DSLHAL", "0.2", action::SET_PARAMETERS, 1001);
        push_param(
            &mut request,
            HalParam::new("Device.DSL.Line.1.Enable", ParamValue::Boolean(true)),
        )
        .unwrap();

        let decoded = Envelope::from_slice(&request.to_wire()).unwrap();

        assert_eq!(decoded, request);
        assert_eq!(
            typed_param(&decoded, 0).unwrap(),
            HalParam::new("Device.DSL.Line.1.Enable", ParamValue::Boolean(true))
        );
    }

    #[test]
    fn test_req_id_accepts_numbers_and_strings() {
        let text: Envelope = serde_json::from_str(r#"{"reqId": "000003E9"}"#).unwrap();
        let number: Envelope = serde_json::from_str(r#"{"reqId": 105}"#).unwrap();

        assert_eq!(text.req_id, Some(ReqId::Text("000003E9".to_owned())));
        assert_eq!(number.req_id, Some(ReqId::Number(105)));
        assert_eq!(number.req_id.unwrap().canonical(), "105");
    }

    #[test]
    fn test_event_envelope_mints_numeric_id() {
        let event = event_envelope("m", "1", 105, "Device.DSL.Line.1.LinkStatus", "Up");

        let text = String::from_utf8(event.to_wire()).unwrap();
        assert!(text.contains("\"reqId\": 105"));

        let param = event.first_param().unwrap();
        assert_eq!(param.name, "Device.DSL.Line.1.LinkStatus");
        assert_eq!(param.value, Some(Value::String("Up".to_owned())));
        assert_eq!(param.param_type, None);
    }

    #[test]
    fn test_event_ack_echoes_id_as_text() {
        let ack = event_ack("m", "1", &ReqId::Number(105), "Device.X", Status::Success);

        assert_eq!(ack.req_id, Some(ReqId::Text("105".to_owned())));
        assert_eq!(result_status(&ack), Some(Status::Success));
        assert_eq!(ack.first_param().unwrap().name, "Device.X");
    }

    #[test]
    fn test_typed_param_value_conversions() {
        let mut envelope = request_header("m", "1", action::SET_PARAMETERS, 200);
        push_param(&mut envelope, HalParam::new("a", ParamValue::Int(-4))).unwrap();
        push_param(&mut envelope, HalParam::new("b", ParamValue::UnsignedLong(1 << 40))).unwrap();
        push_param(&mut envelope, HalParam::new("c", ParamValue::HexBinary("0AFF".into()))).unwrap();

        let decoded = Envelope::from_slice(&envelope.to_wire()).unwrap();

        assert_eq!(typed_param(&decoded, 0).unwrap().value, ParamValue::Int(-4));
        assert_eq!(
            typed_param(&decoded, 1).unwrap().value,
            ParamValue::UnsignedLong(1 << 40)
        );
        assert_eq!(
            typed_param(&decoded, 2).unwrap().value,
            ParamValue::HexBinary("0AFF".into())
        );
    }

    #[test]
    fn test_typed_param_type_mismatch() {
        let decoded: Envelope = serde_json::from_str(
            r#"{"params": [{"name": "a", "type": "boolean", "value": "yes"}]}"#,
        )
        .unwrap();

        assert_eq!(
            typed_param(&decoded, 0),
            Err(HalError::InvalidArgument("parameter value does not match its type"))
        );
    }

    #[test]
    fn test_subscribe_request_modes() {
        let decoded: Envelope = serde_json::from_str(
            r#"{"params": [{"name": "Device.X", "notificationType": "onChangeSyncTimeout"}]}"#,
        )
        .unwrap();

        let request = subscribe_request(&decoded, 0).unwrap();
        assert_eq!(request.name, "Device.X");
        assert_eq!(request.mode, Some(NotificationMode::OnChangeSyncTimeout));
        assert!(request.mode.unwrap().is_synchronous());

        let unknown: Envelope = serde_json::from_str(
            r#"{"params": [{"name": "Device.X", "notificationType": "whenever"}]}"#,
        )
        .unwrap();

        let request = subscribe_request(&unknown, 0).unwrap();
        assert_eq!(request.mode, None);
        assert_eq!(request.raw_mode, "whenever");
    }

    #[test]
    fn test_unknown_status_is_tolerated() {
        let decoded: Envelope =
            serde_json::from_str(r#"{"Result": {"Status": "Bogus"}}"#).unwrap();

        assert_eq!(result_status(&decoded), None);
    }

    #[test]
    fn test_set_schema_path_requires_skeleton() {
        let req_id = ReqId::Text("000000C8".to_owned());
        let mut reply = reply_skeleton("m", "1", action::GET_SCHEMA, &req_id);

        set_schema_path(&mut reply, "/etc/hal/schema.json").unwrap();
        assert_eq!(
            reply.schema_info.unwrap().file_path.as_deref(),
            Some("/etc/hal/schema.json")
        );

        let mut other = reply_skeleton("m", "1", action::SET_PARAMETERS, &req_id);
        assert_eq!(
            set_schema_path(&mut other, "/x"),
            Err(HalError::InvalidArgument("reply has no SchemaInfo"))
        );
    }
}
