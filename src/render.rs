//! Message content rendering: Discord-flavored markdown and link rewriting
//! over `pulldown-cmark`.
//!
//! Contract: input is a stored [`Message`]; output is HTML safe to embed
//! directly in a post page.

use once_cell::sync::Lazy;
use pulldown_cmark::{html, Event, Options, Parser};
use url::Url;

use crate::model::Message;

static DISCORD_MESSAGE_LINK: Lazy<regex::Regex> = Lazy::new(|| {
    regex::Regex::new(r"https?://(?:ptb\.|canary\.)?discord(?:app)?\.com/channels/(\d+)/(\d+)/(\d+)")
        .expect("static regex is valid")
});

/// Render a message's content to HTML: Discord-flavored markdown
/// (bold/italic/underline/strikethrough/monospace already map onto
/// CommonMark closely enough for `pulldown-cmark`), with Discord message
/// links rewritten to point at this mirror's own post pages.
///
/// `content` is untrusted: `pulldown-cmark` passes raw/inline HTML through
/// verbatim by default, so a literal `<script>` in a message would
/// otherwise land in the page unescaped. Raw-HTML events are rewritten to
/// plain `Text` events first, which `push_html` escapes like any other
/// text, so the source never reaches the page as live markup.
pub fn render_content(msg: &Message, public_base_url: &str) -> String {
    let rewritten = rewrite_discord_links(&msg.content, public_base_url);
    let mut options = Options::empty();
    options.insert(Options::ENABLE_STRIKETHROUGH);

    let parser = Parser::new_ext(&rewritten, options).map(|event| match event {
        Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
        other => other,
    });
    let mut html_out = String::new();
    html::push_html(&mut html_out, parser);
    html_out
}

/// Rewrite `discord.com/channels/{guild}/{channel}/{message}` links to
/// `{base}/post/{channel}#{message}` so crawlers never need to follow a
/// link back into the live platform.
fn rewrite_discord_links(content: &str, public_base_url: &str) -> String {
    DISCORD_MESSAGE_LINK
        .replace_all(content, |caps: &regex::Captures| {
            let channel = &caps[2];
            let message = &caps[3];
            format!("{public_base_url}/post/{channel}#{message}")
        })
        .into_owned()
}

/// Split a message's attachments into inline media previews (images,
/// video, audio — anything with a recognizable content type) versus plain
/// downloadable files.
pub fn partition_attachments(msg: &Message) -> (Vec<&crate::model::Attachment>, Vec<&crate::model::Attachment>) {
    let mut media = Vec::new();
    let mut plain = Vec::new();
    for a in &msg.extra.attachments {
        let is_media = a
            .content_type
            .as_deref()
            .map(|ct| ct.starts_with("image/") || ct.starts_with("video/") || ct.starts_with("audio/"))
            .unwrap_or(false);
        if is_media {
            media.push(a);
        } else {
            plain.push(a);
        }
    }
    (media, plain)
}

/// Split a thread's messages into runs of consecutive messages from the
/// same author, so the post page can render one author header per run
/// instead of per message.
pub fn group_consecutive_by_author(messages: &[Message]) -> Vec<Vec<&Message>> {
    let mut groups: Vec<Vec<&Message>> = Vec::new();
    for m in messages {
        match groups.last_mut() {
            Some(last) if last.last().map(|p| p.author_id) == Some(m.author_id) => last.push(m),
            _ => groups.push(vec![m]),
        }
    }
    groups
}

/// Build this mirror's own proxy URL for a remote media URL, or `None` if
/// the URL can't be parsed — used by the post-page template so images load
/// through `/proxy?url=` rather than hot-linking the upstream CDN.
pub fn proxy_url(public_base_url: &str, remote: &str) -> Option<String> {
    let parsed = Url::parse(remote).ok()?;
    Some(format!(
        "{public_base_url}/proxy?url={}",
        urlencoding::encode(parsed.as_str())
    ))
}
