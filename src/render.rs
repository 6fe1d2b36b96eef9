//! Capsule message rendering.
//!
//! A self-addressed send (self-delivery, or an "others" recipient that
//! turns out to be the sender's own address) gets a past-self framing;
//! everything else is framed as mail from the sender. Only the rendered
//! content differs, never the dispatch mechanics.

use crate::storage::capsule::Capsule;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderedMessage {
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}

/// Render one capsule for one recipient.
///
/// `media_links` are already-signed, time-limited URLs plus any direct
/// URLs the capsule carries.
pub fn render_message(
    capsule: &Capsule,
    self_addressed: bool,
    media_links: &[String],
) -> RenderedMessage {
    let subject = if self_addressed {
        format!("Your time capsule \"{}\" has arrived", capsule.title)
    } else {
        format!(
            "{} sent you a time capsule: \"{}\"",
            capsule.owner_email, capsule.title
        )
    };

    let intro = if self_addressed {
        "A message from your past self, delivered right on time.".to_string()
    } else {
        format!(
            "{} wrote this for you a while ago and asked for it to arrive today.",
            capsule.owner_email
        )
    };

    let mut html = String::new();
    html.push_str(&format!("<h1>{}</h1>\n", escape_html(&capsule.title)));
    html.push_str(&format!("<p><em>{}</em></p>\n", escape_html(&intro)));
    html.push_str(&format!(
        "<div class=\"capsule-body\"><p>{}</p></div>\n",
        escape_html(&capsule.message).replace('\n', "<br>\n")
    ));
    if !media_links.is_empty() {
        html.push_str("<h2>Attached memories</h2>\n<ul>\n");
        for link in media_links {
            html.push_str(&format!(
                "<li><a href=\"{0}\">{0}</a></li>\n",
                escape_html(link)
            ));
        }
        html.push_str("</ul>\n");
        html.push_str("<p><small>Media links expire; save anything you want to keep.</small></p>\n");
    }

    let mut text = format!("{}\n\n{}\n\n{}\n", capsule.title, intro, capsule.message);
    if !media_links.is_empty() {
        text.push_str("\nAttached memories:\n");
        for link in media_links {
            text.push_str(&format!("  {}\n", link));
        }
    }

    RenderedMessage {
        subject,
        html_body: html,
        text_body: text,
    }
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::capsule::test_fixtures::scheduled_capsule;

    #[test]
    fn test_self_addressed_framing() {
        let capsule = scheduled_capsule("c1");
        let message = render_message(&capsule, true, &[]);

        assert!(message.subject.contains("Your time capsule"));
        assert!(message.html_body.contains("past self"));
        assert!(!message.html_body.contains("Attached memories"));
    }

    #[test]
    fn test_other_recipient_framing_names_sender() {
        let capsule = scheduled_capsule("c1");
        let message = render_message(&capsule, false, &[]);

        assert!(message.subject.contains("me@example.com"));
        assert!(message.text_body.contains("me@example.com wrote this"));
    }

    #[test]
    fn test_media_links_are_listed() {
        let capsule = scheduled_capsule("c1");
        let links = vec!["https://blob.test/b/m1?expires=60".to_string()];
        let message = render_message(&capsule, true, &links);

        assert!(message.html_body.contains("Attached memories"));
        assert!(message.html_body.contains("https://blob.test/b/m1?expires=60"));
        assert!(message.text_body.contains("https://blob.test/b/m1?expires=60"));
    }

    #[test]
    fn test_html_is_escaped() {
        let mut capsule = scheduled_capsule("c1");
        capsule.message = "<script>alert(1)</script>".to_string();
        let message = render_message(&capsule, true, &[]);

        assert!(!message.html_body.contains("<script>"));
        assert!(message.html_body.contains("&lt;script&gt;"));
    }
}
