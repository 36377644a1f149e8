//! Turns a prompt and its options into an API request.

use super::chunker::TextChunker;
use super::{GenerationOptions, Prompt};
use crate::defaults;
use crate::error::Result;
use crate::format::OutputFormat;
use crate::stream::BodyFraming;
use crate::transport::{ApiRequest, RequestBody};
use serde_json::{Map, Value, json};

/// A request ready for dispatch, plus how its response must be read.
#[derive(Debug)]
pub struct PreparedRequest {
    pub request: ApiRequest,
    pub framing: BodyFraming,
    /// Format of the audio the server will send back.
    pub format: OutputFormat,
    /// Whether the response carries alignment for a transcript.
    pub timestamps: bool,
}

/// Build the request for one generation.
pub fn build_request(voice_id: &str, prompt: Prompt, options: &GenerationOptions) -> Result<PreparedRequest> {
    options.validate()?;
    match prompt {
        Prompt::Text(text) => Ok(text_request(voice_id, text, options)),
        Prompt::Audio(bytes) => Ok(speech_to_speech_request(voice_id, bytes, options)),
        Prompt::TokenStream(fragments) => Ok(input_stream_request(voice_id, fragments, options)),
    }
}

fn text_request(voice_id: &str, text: String, options: &GenerationOptions) -> PreparedRequest {
    let mut body = Map::new();
    body.insert(
        "model_id".to_string(),
        Value::from(options.model_id.as_deref().unwrap_or(defaults::TTS_MODEL)),
    );
    body.insert("text".to_string(), Value::from(text));
    if let Some(settings) = options.voice_settings {
        body.insert("voice_settings".to_string(), settings.to_json());
    }
    if !options.previous_request_ids.is_empty() {
        body.insert(
            "previous_request_ids".to_string(),
            json!(options.previous_request_ids),
        );
    }
    if !options.next_request_ids.is_empty() {
        body.insert("next_request_ids".to_string(), json!(options.next_request_ids));
    }
    if let Some(previous) = &options.previous_text {
        body.insert("previous_text".to_string(), Value::from(previous.as_str()));
    }
    if let Some(next) = &options.next_text {
        body.insert("next_text".to_string(), Value::from(next.as_str()));
    }

    let path = if options.with_timestamps {
        format!("/text-to-speech/{}/stream/with-timestamps", voice_id)
    } else {
        format!("/text-to-speech/{}/stream", voice_id)
    };

    PreparedRequest {
        request: with_common_query(ApiRequest::new(path, RequestBody::Json(Value::Object(body))), options)
            .with_query("output_format", options.output_format),
        framing: if options.with_timestamps {
            BodyFraming::JsonLines
        } else {
            BodyFraming::Raw
        },
        format: options.output_format,
        timestamps: options.with_timestamps,
    }
}

fn speech_to_speech_request(voice_id: &str, audio: Vec<u8>, options: &GenerationOptions) -> PreparedRequest {
    let model_id = match options.model_id.as_deref() {
        Some(model) if model.contains("sts") => model,
        _ => defaults::STS_MODEL,
    };
    let mut fields = vec![("model_id".to_string(), model_id.to_string())];
    if let Some(settings) = options.voice_settings {
        fields.push(("voice_settings".to_string(), settings.to_json().to_string()));
    }

    let path = format!("/speech-to-speech/{}/stream", voice_id);
    let body = RequestBody::Multipart {
        fields,
        file_field: "audio".to_string(),
        file_name: "audio".to_string(),
        bytes: audio,
    };

    PreparedRequest {
        // The endpoint ignores output_format and always answers with the default mp3.
        request: with_common_query(ApiRequest::new(path, body), options),
        framing: BodyFraming::Raw,
        format: OutputFormat::default(),
        timestamps: false,
    }
}

fn input_stream_request(
    voice_id: &str,
    fragments: Box<dyn Iterator<Item = String> + Send>,
    options: &GenerationOptions,
) -> PreparedRequest {
    let input = &options.input_stream;

    let mut opening = Map::new();
    opening.insert("text".to_string(), Value::from(" "));
    opening.insert(
        "try_trigger_generation".to_string(),
        Value::from(input.try_trigger_generation),
    );
    opening.insert(
        "generation_config".to_string(),
        json!({ "chunk_length_schedule": input.chunk_length_schedule }),
    );
    if let Some(settings) = options.voice_settings {
        opening.insert("voice_settings".to_string(), settings.to_json());
    }

    let try_trigger = input.try_trigger_generation;
    let chunks = TextChunker::new(fragments).map(move |text| {
        json!({
            "text": text,
            "try_trigger_generation": try_trigger,
            "flush": false,
        })
    });
    // Opening message, text chunks as they are produced, then an empty text to end input.
    let messages = std::iter::once(Value::Object(opening))
        .chain(chunks)
        .chain(std::iter::once(json!({ "text": "" })));

    let path = format!("/text-to-speech/{}/stream-input", voice_id);
    let request = ApiRequest::new(path, RequestBody::Socket(Box::new(messages)))
        .with_query(
            "model_id",
            options.model_id.as_deref().unwrap_or(defaults::TTS_MODEL),
        )
        .with_query("output_format", options.output_format)
        .with_query("enable_ssml_parsing", input.enable_ssml_parsing);

    PreparedRequest {
        request: with_common_query(request, options),
        framing: BodyFraming::JsonLines,
        format: options.output_format,
        timestamps: true,
    }
}

fn with_common_query(request: ApiRequest, options: &GenerationOptions) -> ApiRequest {
    match options.latency_optimization {
        Some(level) => request.with_query("optimize_streaming_latency", level),
        None => request,
    }
}
