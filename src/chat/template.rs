//! Prompt templates: render chat turns into the text the engine is fed.
//!
//! A template describes a single turn, e.g. ChatML:
//!
//! ```text
//! <|im_start|>{role}\n{content}<|im_end|>\n
//! ```
//!
//! The template is parsed once into segments, so placeholder-looking text
//! inside a message is never expanded.

use thiserror::Error;

use crate::chat::history::{ChatRole, ChatTurn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template has no {{content}} placeholder")]
    MissingContent,

    #[error("template has more than one {{content}} placeholder")]
    DuplicateContent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Role,
    Content,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    segments: Vec<Segment>,
}

impl PromptTemplate {
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = template;
        let mut content_count = 0;

        while !rest.is_empty() {
            if let Some(tail) = rest.strip_prefix("{role}") {
                flush(&mut literal, &mut segments);
                segments.push(Segment::Role);
                rest = tail;
            } else if let Some(tail) = rest.strip_prefix("{content}") {
                flush(&mut literal, &mut segments);
                segments.push(Segment::Content);
                content_count += 1;
                rest = tail;
            } else {
                let ch = rest.chars().next().unwrap_or_default();
                literal.push(ch);
                rest = &rest[ch.len_utf8()..];
            }
        }
        flush(&mut literal, &mut segments);

        match content_count {
            0 => Err(TemplateError::MissingContent),
            1 => Ok(Self { segments }),
            _ => Err(TemplateError::DuplicateContent),
        }
    }

    /// Render one turn.
    pub fn render_turn(&self, turn: &ChatTurn, out: &mut String) {
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Role => out.push_str(turn.role.as_str()),
                Segment::Content => out.push_str(&turn.content),
            }
        }
    }

    /// The text that opens an assistant turn, i.e. the template up to `{content}`.
    pub fn generation_prefix(&self, out: &mut String) {
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Role => out.push_str(ChatRole::Assistant.as_str()),
                Segment::Content => break,
            }
        }
    }

    /// Render a conversation, optionally opening an assistant turn at the end.
    pub fn render<'a>(
        &self,
        turns: impl IntoIterator<Item = &'a ChatTurn>,
        add_generation_prompt: bool,
    ) -> String {
        let mut out = String::new();
        for turn in turns {
            self.render_turn(turn, &mut out);
        }
        if add_generation_prompt {
            self.generation_prefix(&mut out);
        }
        out
    }
}

fn flush(literal: &mut String, segments: &mut Vec<Segment>) {
    if !literal.is_empty() {
        segments.push(Segment::Literal(std::mem::take(literal)));
    }
}
