//! Server-rendered HTML: the landing page and the error page.

const INDEX_TEMPLATE: &str = include_str!("../templates/index.html");
const ERROR_TEMPLATE: &str = include_str!("../templates/error.html");

const MESSAGE_SLOT: &str = "{{message}}";
const STATUS_SLOT: &str = "{{status}}";

pub fn render_index() -> &'static str {
    INDEX_TEMPLATE
}

/// Error page with `message` escaped into the body.
pub fn render_error(status: u16, message: &str) -> String {
    ERROR_TEMPLATE
        .replace(STATUS_SLOT, &status.to_string())
        .replace(MESSAGE_SLOT, &html_escape::encode_text(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_page_escapes_message() {
        let html = render_error(404, "<script>alert(1)</script> & more");
        assert!(html.contains("&lt;script&gt;alert(1)&lt;/script&gt; &amp; more"));
        assert!(html.contains("404"));
        assert!(!html.contains(MESSAGE_SLOT));
        assert!(!html.contains("<script>alert"));
    }

    #[test]
    fn index_wires_the_client() {
        let html = render_index();
        assert!(html.contains("/static/js/app.js"));
        assert!(html.contains("/manifest.json"));
    }
}
