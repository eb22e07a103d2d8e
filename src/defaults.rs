//! Default configuration constants for reflecta.
//!
//! Shared by the configuration types and the components that fall back to
//! them when no configuration is supplied.

/// Sample rate of microphone frames sent to the conversational backend.
pub const CAPTURE_SAMPLE_RATE: u32 = 16000;

/// Sample rate of audio frames produced by the conversational backend.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Samples per outbound capture frame.
///
/// 1600 samples at 16kHz is 100ms of audio, small enough to keep the
/// backend's voice activity detection responsive.
pub const CAPTURE_FRAME_SAMPLES: usize = 1600;

/// WebSocket endpoint of the streaming conversational backend.
pub const LIVE_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Model used on the streaming channel.
pub const LIVE_MODEL: &str = "models/gemini-2.0-flash-exp";

/// Prebuilt voice for spoken replies.
pub const LIVE_VOICE: &str = "Aoede";

/// Time allowed between opening the socket and the backend's setup acknowledgement.
pub const HANDSHAKE_TIMEOUT: &str = "10s";

/// Base URL of the stateless question-generation endpoint.
pub const FALLBACK_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Model used for single-shot question generation.
pub const FALLBACK_MODEL: &str = "gemini-2.0-flash";

/// Request timeout for the fallback endpoint.
pub const FALLBACK_TIMEOUT: &str = "30s";

/// Sampling temperature for fallback questions.
pub const FALLBACK_TEMPERATURE: f32 = 0.7;

/// Opening question used when no generated question is available.
pub const DEFAULT_OPENING_QUESTION: &str =
    "이 콘텐츠에서 가장 기억에 남는 내용은 무엇이었나요?";

/// Follow-up question used when the fallback request fails mid-session.
pub const DEFAULT_FOLLOW_UP: &str =
    "그 부분이 왜 인상 깊었는지 조금 더 이야기해 주시겠어요?";

/// Text sent over the streaming channel to make the backend ask its opening question.
pub const KICKOFF_MESSAGE: &str = "인터뷰를 시작해 주세요. 첫 번째 질문을 해 주세요.";

/// Default log level for the tracing subscriber.
pub const LOG_LEVEL: &str = "info";

/// Capacity of the inbound message channel between a connector and the manager.
pub const INBOUND_BUFFER: usize = 256;
