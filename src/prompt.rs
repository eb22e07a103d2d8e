//! Interview prompts for the streaming channel and the fallback requests.

use crate::fallback::client::QaPair;
use crate::session::model::{ContentItem, ContentKind};

const INTERVIEWER_ROLE: &str = "You are a warm, curious interviewer helping the user reflect on \
something they recently learned. Ask one short, open question at a time, build on the \
user's previous answers, and never lecture or summarize the material yourself. \
Reply in the user's language; if unsure, use Korean.";

/// Descriptive lines for a content item, one field per line.
pub fn describe_content(content: &ContentItem) -> String {
    let mut out = String::new();
    push_line(&mut out, "Title", &content.title);
    push_line(&mut out, "Type", content.kind.label());

    match &content.kind {
        ContentKind::Book { author } => {
            if let Some(author) = author {
                push_line(&mut out, "Author", author);
            }
        }
        ContentKind::Article { url } => {
            if let Some(url) = url {
                push_line(&mut out, "URL", url);
            }
        }
        ContentKind::Video { url, creator } => {
            if let Some(creator) = creator {
                push_line(&mut out, "Creator", creator);
            }
            if let Some(url) = url {
                push_line(&mut out, "URL", url);
            }
        }
        ContentKind::Podcast { show } => {
            if let Some(show) = show {
                push_line(&mut out, "Show", show);
            }
        }
        ContentKind::Course { provider } => {
            if let Some(provider) = provider {
                push_line(&mut out, "Provider", provider);
            }
        }
        ContentKind::Note => {}
    }

    if let Some(description) = content.description.as_deref()
        && !description.trim().is_empty()
    {
        push_line(&mut out, "Description", description.trim());
    }
    if !content.tags.is_empty() {
        push_line(&mut out, "Tags", &content.tags.join(", "));
    }
    out
}

fn push_line(out: &mut String, label: &str, value: &str) {
    out.push_str(label);
    out.push_str(": ");
    out.push_str(value);
    out.push('\n');
}

fn describe_history(history: &[QaPair]) -> String {
    let mut out = String::new();
    for (index, pair) in history.iter().enumerate() {
        push_line(&mut out, &format!("Q{}", index + 1), &pair.question);
        push_line(&mut out, &format!("A{}", index + 1), &pair.answer);
    }
    out
}

/// System instruction sent with the streaming handshake.
///
/// `history` is non-empty when a session reconnects mid-interview.
pub fn system_instruction(content: &ContentItem, history: &[QaPair]) -> String {
    let mut out = format!(
        "{}\n\nThe user learned from:\n{}",
        INTERVIEWER_ROLE,
        describe_content(content)
    );
    if !history.is_empty() {
        out.push_str("\nThe interview so far:\n");
        out.push_str(&describe_history(history));
        out.push_str("\nContinue with the next question.\n");
    }
    out
}

/// Prompt for the opening question of a fallback session.
pub fn first_question_prompt(content: &ContentItem) -> String {
    format!(
        "{}\n\nThe user learned from:\n{}\nWrite only the opening question.",
        INTERVIEWER_ROLE,
        describe_content(content)
    )
}

/// Prompt for the next question, given every answered question so far.
pub fn follow_up_prompt(content: &ContentItem, history: &[QaPair]) -> String {
    format!(
        "{}\n\nThe user learned from:\n{}\nThe interview so far:\n{}\nWrite only the next question.",
        INTERVIEWER_ROLE,
        describe_content(content),
        describe_history(history)
    )
}
