//! Frame codecs for the two upstream services.
//!
//! Recognition frames are flat JSON objects keyed by `action`, with the
//! transcript nested as a JSON *string* inside `data`. Synthesis frames use a
//! `header` / `parameter` / `payload` envelope with base64 audio. Nothing in
//! here knows about sessions; decoding failures are reported as
//! `SessionError::MalformedFrame` and upstream status codes as
//! `SessionError::UpstreamProtocol`.

use super::UpstreamMessage;
use crate::config::VoiceConfig;
use crate::error::SessionError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Synthesis `status` value marking the last frame of a response.
pub const FINAL_STATUS: i64 = 2;

/// A decoded recognition frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionFrame {
    /// Handshake accepted; audio may flow.
    Started { sid: Option<String> },
    /// Cumulative transcript of the current utterance, never empty.
    Partial(String),
    /// The upstream rejected the session.
    Failed { code: i64, message: String },
    /// Anything else (keep-alives, empty results, unknown actions).
    Other,
}

#[derive(Debug, Deserialize)]
struct RecognitionEnvelope {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    code: Option<Value>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    desc: Option<String>,
    #[serde(default)]
    sid: Option<String>,
    #[serde(default)]
    cn: Option<TranscriptBody>,
}

#[derive(Debug, Deserialize)]
struct TranscriptData {
    #[serde(default)]
    cn: Option<TranscriptBody>,
}

#[derive(Debug, Deserialize)]
struct TranscriptBody {
    #[serde(default)]
    st: Option<SentenceBody>,
}

#[derive(Debug, Deserialize)]
struct SentenceBody {
    #[serde(default)]
    rt: Vec<ResultSlot>,
}

#[derive(Debug, Deserialize)]
struct ResultSlot {
    #[serde(default)]
    ws: Vec<WordSlot>,
}

#[derive(Debug, Deserialize)]
struct WordSlot {
    #[serde(default)]
    cw: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    w: String,
}

impl TranscriptBody {
    fn text(&self) -> String {
        let mut text = String::new();
        if let Some(st) = &self.st {
            for word in st.rt.iter().flat_map(|rt| rt.ws.iter()).flat_map(|ws| ws.cw.iter()) {
                text.push_str(&word.w);
            }
        }
        text
    }
}

/// Decode one text frame received from the recognition service.
pub fn decode_recognition_frame(raw: &str) -> Result<RecognitionFrame, SessionError> {
    let envelope: RecognitionEnvelope =
        serde_json::from_str(raw).map_err(|e| SessionError::MalformedFrame(format!("recognition frame: {}", e)))?;

    match envelope.action.as_deref() {
        Some("started") => Ok(RecognitionFrame::Started { sid: envelope.sid }),
        Some("result") => {
            let text = match envelope.data {
                Some(Value::String(data)) => transcript_from_data(&data),
                Some(data @ Value::Object(_)) => {
                    let data: TranscriptData = serde_json::from_value(data)
                        .map_err(|e| SessionError::MalformedFrame(format!("recognition data: {}", e)))?;
                    data.cn.map(|cn| cn.text()).unwrap_or_default()
                }
                _ => String::new(),
            };
            Ok(partial_or_other(text))
        }
        Some("error") => Ok(RecognitionFrame::Failed {
            code: envelope.code.as_ref().map(code_value).unwrap_or(-1),
            message: envelope.desc.filter(|d| !d.is_empty()).unwrap_or_else(|| raw.to_string()),
        }),
        Some(_) => Ok(RecognitionFrame::Other),
        // Some deployments push bare transcripts without an action.
        None => Ok(partial_or_other(envelope.cn.map(|cn| cn.text()).unwrap_or_default())),
    }
}

/// `data` is itself serialized JSON; plain text is passed through as-is.
fn transcript_from_data(data: &str) -> String {
    match serde_json::from_str::<TranscriptData>(data) {
        Ok(parsed) => parsed.cn.map(|cn| cn.text()).unwrap_or_default(),
        Err(_) => data.to_string(),
    }
}

fn partial_or_other(text: String) -> RecognitionFrame {
    let text = text.trim();
    if text.is_empty() {
        RecognitionFrame::Other
    } else {
        RecognitionFrame::Partial(text.to_string())
    }
}

/// Codes arrive as numbers or numeric strings depending on the service.
fn code_value(code: &Value) -> i64 {
    match code {
        Value::Number(n) => n.as_i64().unwrap_or(-1),
        Value::String(s) => s.trim().parse().unwrap_or(-1),
        _ => -1,
    }
}

/// Binary frame telling the recognition service the capture is over.
pub fn end_of_stream_marker() -> UpstreamMessage {
    UpstreamMessage::Binary(br#"{"end": true}"#.to_vec())
}

/// Raw PCM is relayed unchanged as a binary frame.
pub fn audio_frame(pcm: Vec<u8>) -> UpstreamMessage {
    UpstreamMessage::Binary(pcm)
}

#[derive(Debug, Serialize)]
struct SynthesisRequest<'a> {
    header: RequestHeader<'a>,
    parameter: RequestParameter<'a>,
    payload: RequestPayload,
}

#[derive(Debug, Serialize)]
struct RequestHeader<'a> {
    app_id: &'a str,
    status: i64,
}

#[derive(Debug, Serialize)]
struct RequestParameter<'a> {
    oral: OralParameter<'a>,
    tts: TtsParameter<'a>,
}

#[derive(Debug, Serialize)]
struct OralParameter<'a> {
    oral_level: &'a str,
}

#[derive(Debug, Serialize)]
struct TtsParameter<'a> {
    vcn: &'a str,
    speed: u8,
    volume: u8,
    pitch: u8,
    bgs: u8,
    reg: u8,
    rdn: u8,
    rhy: u8,
    audio: AudioFormat,
}

#[derive(Debug, Serialize)]
struct AudioFormat {
    encoding: &'static str,
    sample_rate: u32,
    channels: u8,
    bit_depth: u8,
    frame_size: u32,
}

#[derive(Debug, Serialize)]
struct RequestPayload {
    text: TextPayload,
}

#[derive(Debug, Serialize)]
struct TextPayload {
    encoding: &'static str,
    compress: &'static str,
    format: &'static str,
    status: i64,
    seq: u32,
    text: String,
}

/// Build the single request frame of a synthesis session.
///
/// The whole text goes out in one frame (`status: 2`), base64 encoded.
pub fn encode_synthesis_request(app_id: &str, voice: &VoiceConfig, text: &str) -> Result<String, SessionError> {
    let request = SynthesisRequest {
        header: RequestHeader {
            app_id,
            status: FINAL_STATUS,
        },
        parameter: RequestParameter {
            oral: OralParameter {
                oral_level: &voice.oral_level,
            },
            tts: TtsParameter {
                vcn: &voice.vcn,
                speed: voice.speed,
                volume: voice.volume,
                pitch: voice.pitch,
                bgs: 0,
                reg: 0,
                rdn: 0,
                rhy: 0,
                audio: AudioFormat {
                    encoding: "raw",
                    sample_rate: voice.sample_rate,
                    channels: voice.channels,
                    bit_depth: voice.bit_depth,
                    frame_size: 0,
                },
            },
        },
        payload: RequestPayload {
            text: TextPayload {
                encoding: "utf8",
                compress: "raw",
                format: "plain",
                status: FINAL_STATUS,
                seq: 0,
                text: BASE64.encode(text.as_bytes()),
            },
        },
    };

    serde_json::to_string(&request).map_err(|e| SessionError::MalformedFrame(format!("synthesis request: {}", e)))
}

/// A decoded synthesis response frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisFrame {
    /// Decoded PCM, if this frame carried any.
    pub audio: Option<Vec<u8>>,
    pub is_final: bool,
}

#[derive(Debug, Deserialize)]
struct SynthesisResponse {
    header: ResponseHeader,
    #[serde(default)]
    payload: Option<ResponsePayload>,
}

#[derive(Debug, Deserialize)]
struct ResponseHeader {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: i64,
}

#[derive(Debug, Deserialize)]
struct ResponsePayload {
    #[serde(default)]
    audio: Option<AudioPayload>,
}

#[derive(Debug, Deserialize)]
struct AudioPayload {
    #[serde(default)]
    audio: Option<String>,
}

/// Decode one text frame received from the synthesis service.
pub fn decode_synthesis_frame(raw: &str) -> Result<SynthesisFrame, SessionError> {
    let response: SynthesisResponse =
        serde_json::from_str(raw).map_err(|e| SessionError::MalformedFrame(format!("synthesis frame: {}", e)))?;

    if response.header.code != 0 {
        return Err(SessionError::UpstreamProtocol {
            code: response.header.code,
            message: response.header.message,
        });
    }

    let audio = match response.payload.and_then(|p| p.audio).and_then(|a| a.audio) {
        Some(encoded) if !encoded.is_empty() => Some(
            BASE64
                .decode(encoded.as_bytes())
                .map_err(|e| SessionError::MalformedFrame(format!("synthesis audio: {}", e)))?,
        ),
        _ => None,
    };

    Ok(SynthesisFrame {
        audio,
        is_final: response.header.status == FINAL_STATUS,
    })
}
