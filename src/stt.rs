//! Speech-to-text client
//!
//! Wraps a captured PCM buffer in a WAV envelope and submits it to the
//! transcription endpoint. Transcription failures degrade to an empty
//! transcript; the pipeline treats that as "nothing was said".

use async_trait::async_trait;

use crate::config::SttConfig;
use crate::platform::{CHANNELS, SAMPLE_RATE};
use crate::{Error, Result};

/// Response from the transcription endpoint
#[derive(serde::Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Transcription seam used by the audio pipeline
#[async_trait]
pub trait Transcribe: Send + Sync {
    /// Transcribe interleaved 16-bit 48 kHz stereo PCM to text.
    /// Returns an empty string for too-short or failed input.
    async fn transcribe(&self, pcm: &[u8]) -> Result<String>;
}

/// Transcribes speech via the configured HTTP endpoint
pub struct SttClient {
    client: reqwest::Client,
    config: SttConfig,
    min_speech_ms: u64,
}

impl SttClient {
    #[must_use]
    pub fn new(client: reqwest::Client, config: SttConfig, min_speech_ms: u64) -> Self {
        Self {
            client,
            config,
            min_speech_ms,
        }
    }

    async fn request(&self, wav: Vec<u8>) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| Error::Stt(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.config.model.clone());

        let response = self
            .client
            .post(format!("{}/transcriptions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Stt(format!("HTTP {status}: {body}")));
        }

        let parsed: TranscriptionResponse = response.json().await?;
        Ok(parsed.text)
    }
}

#[async_trait]
impl Transcribe for SttClient {
    async fn transcribe(&self, pcm: &[u8]) -> Result<String> {
        // 48 kHz * 2 ch * 2 bytes per sample
        let min_bytes = (self.min_speech_ms as usize) * 48_000 * 4 / 1000;
        if pcm.len() < min_bytes {
            tracing::debug!(
                bytes = pcm.len(),
                min_bytes,
                "utterance below minimum speech length, skipping STT"
            );
            return Ok(String::new());
        }

        let wav = pcm_to_wav(pcm)?;
        match self.request(wav).await {
            Ok(text) => Ok(text.trim().to_string()),
            Err(e) => {
                tracing::warn!(error = %e, "transcription failed");
                Ok(String::new())
            }
        }
    }
}

/// Wrap interleaved 16-bit PCM in the canonical 44-byte WAV header
///
/// # Errors
///
/// Returns error if WAV encoding fails.
pub fn pcm_to_wav(pcm: &[u8]) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: CHANNELS,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| Error::Stt(e.to_string()))?;

        for sample in pcm.chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([sample[0], sample[1]]))
                .map_err(|e| Error::Stt(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Stt(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_header_is_canonical() {
        // 10 ms of silence
        let pcm = vec![0u8; 1920];
        let wav = pcm_to_wav(&pcm).unwrap();

        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[12..16], b"fmt ");
        assert_eq!(wav.len(), 44 + pcm.len());

        // 2 channels, 48 kHz, 192,000 bytes/sec, block align 4, 16 bits
        assert_eq!(u16::from_le_bytes([wav[22], wav[23]]), 2);
        assert_eq!(u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]), 48_000);
        assert_eq!(u32::from_le_bytes([wav[28], wav[29], wav[30], wav[31]]), 192_000);
        assert_eq!(u16::from_le_bytes([wav[32], wav[33]]), 4);
        assert_eq!(u16::from_le_bytes([wav[34], wav[35]]), 16);
    }

    #[test]
    fn wav_payload_roundtrips() {
        let samples: Vec<i16> = vec![0, 100, -100, 32_000, -32_000];
        let pcm: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let wav = pcm_to_wav(&pcm).unwrap();

        let mut reader = hound::WavReader::new(std::io::Cursor::new(wav)).unwrap();
        let read: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(read, samples);
    }
}
