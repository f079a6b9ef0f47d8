use url::Url;

/// Cache and history key for a URL: fragment dropped, trailing slash on the
/// path ignored, query kept as-is.
pub(crate) fn url_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);

    let path = url.path();
    if path.len() > 1 && path.ends_with('/') {
        let trimmed = path.trim_end_matches('/').to_string();
        url.set_path(&trimmed);
    }

    url.into()
}

/// Whether `a` and `b` point at the same document and differ only in their
/// fragment.
pub(crate) fn same_document(a: &Url, b: &Url) -> bool {
    url_key(a) == url_key(b)
}

/// Resolves `raw` against `base`, so links taken straight from `href`
/// attributes can be passed in.
pub(crate) fn resolve(raw: &str, base: Option<&Url>) -> Result<Url, url::ParseError> {
    Url::options().base_url(base).parse(raw)
}

/// Installs a `tracing` subscriber honouring `RUST_LOG`, defaulting to `info`
/// for this crate.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, Registry};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("utsuri=info"));
    let fmt = tracing_subscriber::fmt::layer().with_target(true);

    Registry::default().with(filter).with(fmt).try_init()?;

    Ok(())
}
