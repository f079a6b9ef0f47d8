use serde::Serialize;
use url::Url;

use super::fragment::Fragment;

/// Resource URLs referenced by a preloaded page.
///
/// Only `<script src>`, `<link rel=stylesheet href>`, `<img src>` and inline
/// `background-image: url(...)` declarations are looked at, everything else in
/// the document is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Resources {
    pub scripts: Vec<Url>,
    pub styles: Vec<Url>,
    pub images: Vec<Url>,
    pub backgrounds: Vec<Url>,
}

impl Resources {
    pub fn extract(fragment: &Fragment, base: &Url) -> Self {
        let mut resources = Resources::default();

        for el in fragment.elements() {
            match el.tag() {
                "script" => push_unique(&mut resources.scripts, base, el.attr("src")),
                "link" if is_stylesheet(el.attr("rel")) => {
                    push_unique(&mut resources.styles, base, el.attr("href"))
                }
                "img" => push_unique(&mut resources.images, base, el.attr("src")),
                _ => {}
            }

            if let Some(style) = el.attr("style") {
                for raw in background_urls(style) {
                    push_unique(&mut resources.backgrounds, base, Some(raw));
                }
            }
        }

        resources
    }

    pub fn len(&self) -> usize {
        self.scripts.len() + self.styles.len() + self.images.len() + self.backgrounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resources worth warming ahead of a swap. Scripts are left out, running
    /// them is the navigation library's business.
    pub fn warmable(&self) -> impl Iterator<Item = &Url> {
        self.styles
            .iter()
            .chain(self.images.iter())
            .chain(self.backgrounds.iter())
    }
}

fn is_stylesheet(rel: Option<&str>) -> bool {
    rel.is_some_and(|rel| {
        rel.split_ascii_whitespace()
            .any(|token| token.eq_ignore_ascii_case("stylesheet"))
    })
}

fn push_unique(acc: &mut Vec<Url>, base: &Url, raw: Option<&str>) {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return;
    };

    // data: URIs are already in memory
    if raw.starts_with("data:") {
        return;
    }

    match base.join(raw) {
        Ok(url) if !acc.contains(&url) => acc.push(url),
        Ok(_) => {}
        Err(err) => tracing::trace!("skipping resource '{raw}': {err}"),
    }
}

/// Pulls every `url(...)` out of a `background`/`background-image`
/// declaration in an inline style attribute.
fn background_urls(style: &str) -> Vec<&str> {
    let mut found = Vec::new();

    for declaration in style.split(';') {
        let Some((property, value)) = declaration.split_once(':') else {
            continue;
        };
        let property = property.trim().to_ascii_lowercase();
        if property != "background" && property != "background-image" {
            continue;
        }

        let mut rest = value;
        while let Some(start) = rest.find("url(") {
            let after = &rest[start + 4..];
            let Some(end) = after.find(')') else {
                break;
            };
            let inner = after[..end].trim().trim_matches(['"', '\'']);
            if !inner.is_empty() {
                found.push(inner);
            }
            rest = &after[end + 1..];
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://blog.example/archives/12/").unwrap()
    }

    #[test]
    fn test_extract() {
        let fragment = Fragment::parse(
            r#"<html><head>
                <link rel="stylesheet" href="/theme.css">
                <link rel="icon" href="/favicon.ico">
                <script src="app.js"></script>
                <script>inline()</script>
            </head><body>
                <img src="cover.jpg"><img src="cover.jpg"><img src="data:image/png;base64,AAAA">
                <div style="color: red; background-image: url('/bg/one.png')"></div>
                <div style="background: #fff url(two.webp) no-repeat"></div>
            </body></html>"#,
        );

        let resources = Resources::extract(&fragment, &base());

        assert_eq!(resources.styles, vec![Url::parse("https://blog.example/theme.css").unwrap()]);
        assert_eq!(
            resources.scripts,
            vec![Url::parse("https://blog.example/archives/12/app.js").unwrap()]
        );
        assert_eq!(
            resources.images,
            vec![Url::parse("https://blog.example/archives/12/cover.jpg").unwrap()]
        );
        assert_eq!(
            resources.backgrounds,
            vec![
                Url::parse("https://blog.example/bg/one.png").unwrap(),
                Url::parse("https://blog.example/archives/12/two.webp").unwrap(),
            ]
        );
        assert_eq!(resources.len(), 5);
        assert_eq!(resources.warmable().count(), 4);
    }

    #[test]
    fn test_background_urls() {
        assert_eq!(
            background_urls("background-image: url(a.png), url(\"b.png\")"),
            vec!["a.png", "b.png"]
        );
        assert!(background_urls("border-image: url(a.png)").is_empty());
        assert!(background_urls("background: url(broken").is_empty());
    }
}
