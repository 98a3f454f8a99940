//! Model provider seam
//!
//! The workbench does not call a model itself. A [`CodeModel`] turns a UI
//! image into a prompt, and a prompt into generated code, each as a lazy,
//! finite, non-restartable stream of text fragments.

use std::fmt;
use std::pin::Pin;
use std::str::FromStr;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::generation::TEMPERATURE;

/// Text fragments as they arrive from the model
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Stream interrupted: {0}")]
    Stream(String),

    #[error("Invalid image data: {0}")]
    InvalidImage(String),
}

/// Target framework for generated applications
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationFramework {
    #[default]
    React,
    Vue,
    #[serde(rename = "nextjs")]
    NextJs,
}

impl ApplicationFramework {
    pub const ALL: [Self; 3] = [Self::React, Self::Vue, Self::NextJs];

    pub fn id(&self) -> &'static str {
        match self {
            Self::React => "react",
            Self::Vue => "vue",
            Self::NextJs => "nextjs",
        }
    }

    /// Display name
    pub fn label(&self) -> &'static str {
        match self {
            Self::React => "React",
            Self::Vue => "Vue",
            Self::NextJs => "Next.js",
        }
    }
}

impl fmt::Display for ApplicationFramework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ApplicationFramework {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|framework| framework.id().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown framework '{}' (expected react, vue or nextjs)", s))
    }
}

/// Base64 image payload without any data-URL prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageData {
    pub base64: String,
}

impl ImageData {
    /// Accepts either `data:image/png;base64,<payload>` or a raw payload
    pub fn from_data_url(input: &str) -> Result<Self, ProviderError> {
        let payload = if input.starts_with("data:") {
            input
                .split_once(',')
                .map(|(_, payload)| payload)
                .ok_or_else(|| ProviderError::InvalidImage("data URL has no payload".to_string()))?
        } else {
            input
        };

        let payload = payload.trim();
        if payload.is_empty() {
            return Err(ProviderError::InvalidImage("empty image".to_string()));
        }
        Ok(Self {
            base64: payload.to_string(),
        })
    }
}

/// Request to describe a UI image as a code-generation prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRequest {
    pub image: ImageData,
    pub framework: ApplicationFramework,
    pub temperature: f32,
}

impl PromptRequest {
    pub fn new(image: ImageData, framework: ApplicationFramework) -> Self {
        Self {
            image,
            framework,
            temperature: TEMPERATURE,
        }
    }
}

/// Request to generate application code from a prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeRequest {
    pub prompt: String,
    /// Source image, sent along only when generating "code with image"
    pub image: Option<ImageData>,
    pub framework: ApplicationFramework,
    pub temperature: f32,
}

impl CodeRequest {
    pub fn new(prompt: impl Into<String>, framework: ApplicationFramework) -> Self {
        Self {
            prompt: prompt.into(),
            image: None,
            framework,
            temperature: TEMPERATURE,
        }
    }

    pub fn with_image(mut self, image: ImageData) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// A model that can describe images and generate code
#[async_trait]
pub trait CodeModel: Send + Sync {
    /// Stream a code-generation prompt describing the image
    async fn describe_image(&self, request: PromptRequest) -> Result<FragmentStream, ProviderError>;

    /// Stream generated code interleaved with action blocks
    async fn generate_code(&self, request: CodeRequest) -> Result<FragmentStream, ProviderError>;
}

/// Drain a prompt stream into one string
pub async fn collect_prompt(mut stream: FragmentStream) -> Result<String, ProviderError> {
    let mut prompt = String::new();
    while let Some(fragment) = stream.next().await {
        prompt.push_str(&fragment?);
    }
    Ok(prompt)
}

/// Stream over already-known fragments
pub fn fragments_from<I>(fragments: I) -> FragmentStream
where
    I: IntoIterator<Item = String>,
    I::IntoIter: Send + 'static,
{
    Box::pin(futures_util::stream::iter(fragments.into_iter().map(Ok)))
}
