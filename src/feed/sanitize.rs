use std::collections::HashSet;

/// Clean an untrusted HTML fragment from a feed item.
///
/// Executable and active markup (`<script>`, `<style>`, `<iframe>`, event
/// handler attributes, `javascript:` links) is removed; ordinary formatting
/// such as paragraphs, emphasis, lists, links and images survives. Links get
/// `rel="noopener noreferrer"`. Text that is not markup comes back
/// HTML-escaped.
pub fn sanitize_html(html: &str) -> String {
    if html.is_empty() {
        return String::new();
    }

    let schemes: HashSet<&str> = ["http", "https", "mailto"].into_iter().collect();
    ammonia::Builder::default()
        .url_schemes(schemes)
        .link_rel(Some("noopener noreferrer"))
        .clean(html)
        .to_string()
}
