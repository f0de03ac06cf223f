use crate::http::Headers;
use crate::time::Seconds;

/// Cache directives carried by a request or response. Both `Cache-Control`
/// and `Pragma` headers contribute; unknown directives are ignored.
#[derive(Clone, Debug, Default, PartialEq, Builder)]
#[builder(pattern = "owned", default)]
pub struct CacheControl {
    pub no_cache: bool,
    pub no_store: bool,
    pub max_age: Option<Seconds>,
    pub s_max_age: Option<Seconds>,
    pub private: bool,
    pub public: bool,
    pub must_revalidate: bool,
    pub max_stale: Option<Seconds>,
    pub min_fresh: Option<Seconds>,
    pub only_if_cached: bool,
    pub no_transform: bool,
    pub immutable: bool,
}

impl CacheControl {
    pub fn builder() -> CacheControlBuilder {
        CacheControlBuilder::default()
    }

    /// Request directives that skip the cache entirely.
    pub fn force_network() -> Self {
        CacheControl {
            no_cache: true,
            ..Default::default()
        }
    }

    /// Request directives that forbid the network, accepting stale data.
    pub fn force_cache() -> Self {
        CacheControl {
            only_if_cached: true,
            max_stale: Some(Seconds::new(u64::MAX)),
            ..Default::default()
        }
    }

    pub fn parse(headers: &Headers) -> Self {
        let mut control = CacheControl::default();
        for (name, value) in headers.iter() {
            if !name.eq_ignore_ascii_case("Cache-Control") && !name.eq_ignore_ascii_case("Pragma") {
                continue;
            }
            parse_directives(value, &mut control);
        }
        control
    }

    /// Render back to a `Cache-Control` header value.
    pub fn header_value(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if self.no_cache {
            parts.push("no-cache".to_string());
        }
        if self.no_store {
            parts.push("no-store".to_string());
        }
        if let Some(max_age) = self.max_age {
            parts.push(format!("max-age={max_age}"));
        }
        if let Some(s_max_age) = self.s_max_age {
            parts.push(format!("s-maxage={s_max_age}"));
        }
        if self.private {
            parts.push("private".to_string());
        }
        if self.public {
            parts.push("public".to_string());
        }
        if self.must_revalidate {
            parts.push("must-revalidate".to_string());
        }
        if let Some(max_stale) = self.max_stale {
            parts.push(format!("max-stale={max_stale}"));
        }
        if let Some(min_fresh) = self.min_fresh {
            parts.push(format!("min-fresh={min_fresh}"));
        }
        if self.only_if_cached {
            parts.push("only-if-cached".to_string());
        }
        if self.no_transform {
            parts.push("no-transform".to_string());
        }
        if self.immutable {
            parts.push("immutable".to_string());
        }
        parts.join(", ")
    }
}

fn parse_directives(value: &str, control: &mut CacheControl) {
    let mut pos = 0;
    while pos < value.len() {
        let token_start = pos;
        pos = skip_until(value, pos, "=,;");
        let directive = value[token_start..pos].trim();

        let parameter = if pos == value.len()
            || value[pos..].starts_with(',')
            || value[pos..].starts_with(';')
        {
            pos += 1;
            None
        } else {
            // Consume '=' then an optionally quoted parameter.
            pos += 1;
            pos = skip_whitespace(value, pos);
            if value[pos..].starts_with('"') {
                pos += 1;
                let parameter_start = pos;
                pos = skip_until(value, pos, "\"");
                let parameter = &value[parameter_start..pos];
                pos += 1;
                Some(parameter)
            } else {
                let parameter_start = pos;
                pos = skip_until(value, pos, ",;");
                Some(value[parameter_start..pos].trim())
            }
        };

        if directive.eq_ignore_ascii_case("no-cache") {
            control.no_cache = true;
        } else if directive.eq_ignore_ascii_case("no-store") {
            control.no_store = true;
        } else if directive.eq_ignore_ascii_case("max-age") {
            control.max_age = parse_seconds(parameter, None);
        } else if directive.eq_ignore_ascii_case("s-maxage") {
            control.s_max_age = parse_seconds(parameter, None);
        } else if directive.eq_ignore_ascii_case("private") {
            control.private = true;
        } else if directive.eq_ignore_ascii_case("public") {
            control.public = true;
        } else if directive.eq_ignore_ascii_case("must-revalidate") {
            control.must_revalidate = true;
        } else if directive.eq_ignore_ascii_case("max-stale") {
            control.max_stale = parse_seconds(parameter, Some(Seconds::new(u64::MAX)));
        } else if directive.eq_ignore_ascii_case("min-fresh") {
            control.min_fresh = parse_seconds(parameter, None);
        } else if directive.eq_ignore_ascii_case("only-if-cached") {
            control.only_if_cached = true;
        } else if directive.eq_ignore_ascii_case("no-transform") {
            control.no_transform = true;
        } else if directive.eq_ignore_ascii_case("immutable") {
            control.immutable = true;
        }
    }
}

/// Negative values clamp to zero, unparseable values fall back to `default`.
fn parse_seconds(parameter: Option<&str>, default: Option<Seconds>) -> Option<Seconds> {
    let parameter = parameter?;
    match parameter.parse::<i64>() {
        Ok(n) if n < 0 => Some(Seconds::new(0)),
        Ok(n) => Some(Seconds::new(n as u64)),
        Err(_) => default,
    }
}

fn skip_until(value: &str, pos: usize, delimiters: &str) -> usize {
    value[pos..]
        .char_indices()
        .find(|(_, c)| delimiters.contains(*c))
        .map(|(i, _)| pos + i)
        .unwrap_or(value.len())
}

fn skip_whitespace(value: &str, pos: usize) -> usize {
    value[pos..]
        .char_indices()
        .find(|(_, c)| *c != ' ' && *c != '\t')
        .map(|(i, _)| pos + i)
        .unwrap_or(value.len())
}
