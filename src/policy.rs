use crate::control::CacheControl;
use crate::http::{Request, Response};
use crate::time::{self, Milliseconds};

const WARNING_STALE: &str = "110 hoard \"Response is stale\"";
const WARNING_HEURISTIC: &str = "113 hoard \"Heuristic expiration\"";
const ONE_DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// What to do about one request, given what the cache holds for it.
///
/// - network only: `network_request` set, `cache_response` empty
/// - serve from cache: `cache_response` set, `network_request` empty
/// - conditional revalidation: both set, the request carries
///   `If-None-Match`/`If-Modified-Since`
/// - unsatisfiable: neither set — the caller forbade the network and the
///   cache cannot answer
pub struct Verdict {
    pub network_request: Option<Request>,
    pub cache_response: Option<Response>,
}

impl Verdict {
    pub fn is_unsatisfiable(&self) -> bool {
        self.network_request.is_none() && self.cache_response.is_none()
    }
}

/// Decide between cache, network, or both for `request`, with
/// `cache_response` as the stored candidate. Pure apart from the `now`
/// argument; safe to call with any clock in tests.
pub fn evaluate(now: Milliseconds, request: &Request, cache_response: Option<Response>) -> Verdict {
    let candidate = Factory::new(now, request, cache_response).candidate();
    if candidate.network_request.is_some() && request.cache_control().only_if_cached {
        // Forbidden from using the network and the cache is insufficient.
        return Verdict {
            network_request: None,
            cache_response: None,
        };
    }
    candidate
}

/// True when a response with this status may be stored at all, per its own
/// directives and the request's. 302/307 additionally need an explicit
/// expiration or a public/private marker.
pub fn is_cacheable(response: &Response, request: &Request) -> bool {
    match response.status() {
        200 | 203 | 204 | 300 | 301 | 404 | 405 | 410 | 414 | 501 | 308 => {}
        302 | 307 => {
            let control = response.cache_control();
            if response.header("Expires").is_none()
                && control.max_age.is_none()
                && !control.public
                && !control.private
            {
                return false;
            }
        }
        _ => return false,
    }
    !response.cache_control().no_store && !request.cache_control().no_store
}

struct Factory<'a> {
    now_millis: i64,
    request: &'a Request,
    cache_response: Option<Response>,
    /// The server's time when the cached response was served, if known.
    served_date: Option<i64>,
    served_date_string: Option<String>,
    last_modified: Option<i64>,
    last_modified_string: Option<String>,
    expires: Option<i64>,
    sent_request_millis: i64,
    received_response_millis: i64,
    etag: Option<String>,
    age_seconds: Option<i64>,
}

impl<'a> Factory<'a> {
    fn new(now: Milliseconds, request: &'a Request, cache_response: Option<Response>) -> Self {
        let mut factory = Factory {
            now_millis: now.as_i64(),
            request,
            cache_response,
            served_date: None,
            served_date_string: None,
            last_modified: None,
            last_modified_string: None,
            expires: None,
            sent_request_millis: 0,
            received_response_millis: 0,
            etag: None,
            age_seconds: None,
        };
        if let Some(cached) = factory.cache_response.as_ref() {
            factory.sent_request_millis = cached.sent_request_at().as_i64();
            factory.received_response_millis = cached.received_response_at().as_i64();
            for (name, value) in cached.headers().iter() {
                if name.eq_ignore_ascii_case("Date") {
                    factory.served_date = time::parse_http_date(value);
                    factory.served_date_string = Some(value.clone());
                } else if name.eq_ignore_ascii_case("Expires") {
                    factory.expires = time::parse_http_date(value);
                } else if name.eq_ignore_ascii_case("Last-Modified") {
                    factory.last_modified = time::parse_http_date(value);
                    factory.last_modified_string = Some(value.clone());
                } else if name.eq_ignore_ascii_case("ETag") {
                    factory.etag = Some(value.clone());
                } else if name.eq_ignore_ascii_case("Age") {
                    factory.age_seconds = value.parse::<i64>().ok().map(|age| age.max(0));
                }
            }
        }
        factory
    }

    fn candidate(mut self) -> Verdict {
        let Some(cache_response) = self.cache_response.take() else {
            return self.network_only();
        };

        // An HTTPS response without a recorded handshake cannot be trusted.
        if self.request.is_https() && cache_response.handshake().is_none() {
            return self.network_only();
        }

        if !is_cacheable(&cache_response, self.request) {
            return self.network_only();
        }

        let request_caching = self.request.cache_control();
        if request_caching.no_cache || has_conditions(self.request) {
            return self.network_only();
        }

        let response_caching = cache_response.cache_control();

        let age_millis = self.cache_response_age();
        let mut fresh_millis = self.freshness_lifetime(&cache_response, &response_caching);
        if let Some(max_age) = request_caching.max_age {
            fresh_millis = fresh_millis.min(max_age.as_millis());
        }

        let min_fresh_millis = request_caching
            .min_fresh
            .map(|s| s.as_millis())
            .unwrap_or(0);

        // max-stale is only honored when the server did not insist on
        // revalidation.
        let mut max_stale_millis = 0;
        if !response_caching.must_revalidate {
            if let Some(max_stale) = request_caching.max_stale {
                max_stale_millis = max_stale.as_millis();
            }
        }

        if !response_caching.no_cache
            && age_millis.saturating_add(min_fresh_millis)
                < fresh_millis.saturating_add(max_stale_millis)
        {
            let mut response = cache_response;
            if age_millis.saturating_add(min_fresh_millis) >= fresh_millis {
                response.add_header("Warning", WARNING_STALE);
            }
            if age_millis > ONE_DAY_MILLIS && self.freshness_lifetime_is_heuristic(&response_caching)
            {
                response.add_header("Warning", WARNING_HEURISTIC);
            }
            return Verdict {
                network_request: None,
                cache_response: Some(response),
            };
        }

        // Find a condition to validate with, strongest first.
        let (condition_name, condition_value) = if let Some(etag) = self.etag.as_ref() {
            ("If-None-Match", etag.clone())
        } else if let Some(last_modified) = self.last_modified_string.as_ref() {
            ("If-Modified-Since", last_modified.clone())
        } else if let Some(served_date) = self.served_date_string.as_ref() {
            ("If-Modified-Since", served_date.clone())
        } else {
            // No condition to send; make a regular request.
            return self.network_only();
        };

        let mut conditional_request = self.request.clone();
        conditional_request.set_header(condition_name, &condition_value);
        Verdict {
            network_request: Some(conditional_request),
            cache_response: Some(cache_response),
        }
    }

    fn network_only(&self) -> Verdict {
        Verdict {
            network_request: Some(self.request.clone()),
            cache_response: None,
        }
    }

    /// RFC 7234 age: apparent age from the Date header, corrected by any
    /// Age header, plus transit and residence time.
    fn cache_response_age(&self) -> i64 {
        let apparent_received_age = self
            .served_date
            .map(|served| (self.received_response_millis - served).max(0))
            .unwrap_or(0);
        let received_age = match self.age_seconds {
            Some(age) => apparent_received_age.max(age.saturating_mul(1000)),
            None => apparent_received_age,
        };
        let response_duration = self.received_response_millis - self.sent_request_millis;
        let resident_duration = self.now_millis - self.received_response_millis;
        received_age + response_duration + resident_duration
    }

    fn freshness_lifetime(&self, cache_response: &Response, response_caching: &CacheControl) -> i64 {
        if let Some(max_age) = response_caching.max_age {
            return max_age.as_millis();
        }
        if let Some(expires) = self.expires {
            let served = self.served_date.unwrap_or(self.received_response_millis);
            return (expires - served).max(0);
        }
        if let Some(last_modified) = self.last_modified {
            // Heuristic freshness: a tenth of the document's age at serve
            // time. Deliberately skipped for parameterized URLs, which tend
            // to be dynamic no matter what Last-Modified claims.
            if cache_response.request().query().is_none() {
                let served = self.served_date.unwrap_or(self.sent_request_millis);
                let delta = served - last_modified;
                return if delta > 0 { delta / 10 } else { 0 };
            }
        }
        0
    }

    fn freshness_lifetime_is_heuristic(&self, response_caching: &CacheControl) -> bool {
        response_caching.max_age.is_none() && self.expires.is_none()
    }
}

fn has_conditions(request: &Request) -> bool {
    request.header("If-Modified-Since").is_some() || request.header("If-None-Match").is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Handshake, Headers, Method, Request, Response, TlsVersion};
    use crate::time::format_http_date;

    // A fixed clock keeps the arithmetic in the tests exact.
    const T0: i64 = 1_700_000_000_000;

    fn request(url: &str) -> Request {
        Request::builder().url(url).build().unwrap()
    }

    fn request_with(url: &str, name: &str, value: &str) -> Request {
        let mut headers = Headers::new();
        headers.add(name, value);
        Request::builder().url(url).headers(headers).build().unwrap()
    }

    fn cached(url: &str, header_list: &[(&str, &str)]) -> Response {
        let mut headers = Headers::new();
        for (name, value) in header_list {
            headers.add(*name, *value);
        }
        Response::builder()
            .request(request(url))
            .status(200)
            .message("OK")
            .headers(headers)
            .sent_request_at(Milliseconds::new(T0 as u64))
            .received_response_at(Milliseconds::new(T0 as u64))
            .build()
            .unwrap()
    }

    fn at(offset_millis: i64) -> Milliseconds {
        Milliseconds::new((T0 + offset_millis) as u64)
    }

    #[test]
    fn test_no_cached_entry_goes_to_network() {
        let request = request("http://example.com/");
        let verdict = evaluate(at(0), &request, None);
        assert!(verdict.network_request.is_some());
        assert!(verdict.cache_response.is_none());
    }

    #[test]
    fn test_fresh_within_max_age_served_from_cache() {
        let request = request("http://example.com/");
        let date = format_http_date(T0);
        let response = cached(
            "http://example.com/",
            &[("Date", &date), ("Cache-Control", "max-age=600")],
        );
        let verdict = evaluate(at(300_000), &request, Some(response));
        assert!(verdict.network_request.is_none());
        let served = verdict.cache_response.unwrap();
        assert!(served.headers().values("Warning").is_empty());
    }

    #[test]
    fn test_stale_past_max_age_revalidates_with_etag() {
        let request = request("http://example.com/");
        let date = format_http_date(T0);
        let response = cached(
            "http://example.com/",
            &[
                ("Date", &date),
                ("Cache-Control", "max-age=600"),
                ("ETag", "\"v1\""),
            ],
        );
        let verdict = evaluate(at(700_000), &request, Some(response));
        let network_request = verdict.network_request.expect("conditional request");
        assert_eq!(Some("\"v1\""), network_request.header("If-None-Match"));
        assert!(verdict.cache_response.is_some());
    }

    #[test]
    fn test_stale_without_validators_goes_to_network() {
        let request = request("http://example.com/");
        let response = cached("http://example.com/", &[("Cache-Control", "max-age=0")]);
        let verdict = evaluate(at(10_000), &request, Some(response));
        assert!(verdict.network_request.is_some());
        assert!(verdict.cache_response.is_none());
    }

    #[test]
    fn test_last_modified_used_when_no_etag() {
        let request = request("http://example.com/");
        let date = format_http_date(T0);
        let last_modified = format_http_date(T0 - ONE_DAY_MILLIS);
        let response = cached(
            "http://example.com/",
            &[
                ("Date", &date),
                ("Cache-Control", "max-age=0"),
                ("Last-Modified", &last_modified),
            ],
        );
        let verdict = evaluate(at(10_000), &request, Some(response));
        let network_request = verdict.network_request.expect("conditional request");
        assert_eq!(
            Some(last_modified.as_str()),
            network_request.header("If-Modified-Since")
        );
    }

    #[test]
    fn test_only_if_cached_without_entry_is_unsatisfiable() {
        let request = request_with("http://example.com/", "Cache-Control", "only-if-cached");
        let verdict = evaluate(at(0), &request, None);
        assert!(verdict.is_unsatisfiable());
    }

    #[test]
    fn test_only_if_cached_with_stale_entry_is_unsatisfiable() {
        let request = request_with("http://example.com/", "Cache-Control", "only-if-cached");
        let date = format_http_date(T0);
        let response = cached(
            "http://example.com/",
            &[("Date", &date), ("Cache-Control", "max-age=1"), ("ETag", "\"a\"")],
        );
        let verdict = evaluate(at(60_000), &request, Some(response));
        assert!(verdict.is_unsatisfiable());
    }

    #[test]
    fn test_request_no_cache_skips_candidate() {
        let request = request_with("http://example.com/", "Cache-Control", "no-cache");
        let date = format_http_date(T0);
        let response = cached(
            "http://example.com/",
            &[("Date", &date), ("Cache-Control", "max-age=600")],
        );
        let verdict = evaluate(at(0), &request, Some(response));
        assert!(verdict.network_request.is_some());
        assert!(verdict.cache_response.is_none());
    }

    #[test]
    fn test_request_with_own_conditions_skips_candidate() {
        let request = request_with("http://example.com/", "If-None-Match", "\"x\"");
        let date = format_http_date(T0);
        let response = cached(
            "http://example.com/",
            &[("Date", &date), ("Cache-Control", "max-age=600")],
        );
        let verdict = evaluate(at(0), &request, Some(response));
        assert!(verdict.cache_response.is_none());
    }

    #[test]
    fn test_no_store_response_not_served() {
        let request = request("http://example.com/");
        let date = format_http_date(T0);
        let response = cached(
            "http://example.com/",
            &[("Date", &date), ("Cache-Control", "no-store, max-age=600")],
        );
        let verdict = evaluate(at(0), &request, Some(response));
        assert!(verdict.cache_response.is_none());
    }

    #[test]
    fn test_https_without_handshake_not_served() {
        let request = request("https://example.com/");
        let date = format_http_date(T0);
        let response = cached(
            "https://example.com/",
            &[("Date", &date), ("Cache-Control", "max-age=600")],
        );
        let verdict = evaluate(at(0), &request, Some(response));
        assert!(verdict.cache_response.is_none());
    }

    #[test]
    fn test_https_with_handshake_served() {
        let request = request("https://example.com/");
        let date = format_http_date(T0);
        let mut headers = Headers::new();
        headers.add("Date", date);
        headers.add("Cache-Control", "max-age=600");
        let response = Response::builder()
            .request(request.clone())
            .status(200)
            .headers(headers)
            .handshake(Handshake {
                tls_version: TlsVersion::Tls13,
                cipher_suite: "TLS_AES_128_GCM_SHA256".to_string(),
                peer_certificates: vec![],
                local_certificates: vec![],
            })
            .sent_request_at(Milliseconds::new(T0 as u64))
            .received_response_at(Milliseconds::new(T0 as u64))
            .build()
            .unwrap();
        let verdict = evaluate(at(0), &request, Some(response));
        assert!(verdict.cache_response.is_some());
        assert!(verdict.network_request.is_none());
    }

    #[test]
    fn test_max_stale_serves_stale_with_warning() {
        let request = request_with("http://example.com/", "Cache-Control", "max-stale=600");
        let date = format_http_date(T0);
        let response = cached(
            "http://example.com/",
            &[("Date", &date), ("Cache-Control", "max-age=100")],
        );
        let verdict = evaluate(at(300_000), &request, Some(response));
        assert!(verdict.network_request.is_none());
        let served = verdict.cache_response.unwrap();
        assert_eq!(
            vec!["110 hoard \"Response is stale\""],
            served.headers().values("Warning")
        );
    }

    #[test]
    fn test_must_revalidate_ignores_max_stale() {
        let request = request_with("http://example.com/", "Cache-Control", "max-stale=600");
        let date = format_http_date(T0);
        let response = cached(
            "http://example.com/",
            &[
                ("Date", &date),
                ("Cache-Control", "max-age=100, must-revalidate"),
                ("ETag", "\"a\""),
            ],
        );
        let verdict = evaluate(at(300_000), &request, Some(response));
        assert!(verdict.network_request.is_some());
    }

    #[test]
    fn test_min_fresh_demands_remaining_freshness() {
        let request = request_with("http://example.com/", "Cache-Control", "min-fresh=300");
        let date = format_http_date(T0);
        let response = cached(
            "http://example.com/",
            &[("Date", &date), ("Cache-Control", "max-age=400"), ("ETag", "\"a\"")],
        );
        // 200s old with 200s left, but 300s of slack demanded.
        let verdict = evaluate(at(200_000), &request, Some(response));
        assert!(verdict.network_request.is_some());
    }

    #[test]
    fn test_request_max_age_caps_freshness() {
        let request = request_with("http://example.com/", "Cache-Control", "max-age=100");
        let date = format_http_date(T0);
        let response = cached(
            "http://example.com/",
            &[("Date", &date), ("Cache-Control", "max-age=600"), ("ETag", "\"a\"")],
        );
        let verdict = evaluate(at(300_000), &request, Some(response));
        assert!(verdict.network_request.is_some());
    }

    #[test]
    fn test_expires_header_grants_freshness() {
        let request = request("http://example.com/");
        let date = format_http_date(T0);
        let expires = format_http_date(T0 + 600_000);
        let response = cached(
            "http://example.com/",
            &[("Date", &date), ("Expires", &expires)],
        );
        let verdict = evaluate(at(300_000), &request, Some(response));
        assert!(verdict.network_request.is_none());
        assert!(verdict.cache_response.is_some());
    }

    #[test]
    fn test_heuristic_freshness_from_last_modified() {
        let request = request("http://example.com/doc");
        let date = format_http_date(T0);
        // Ten days old at serve time: fresh for one day.
        let last_modified = format_http_date(T0 - 10 * ONE_DAY_MILLIS);
        let response = cached(
            "http://example.com/doc",
            &[("Date", &date), ("Last-Modified", &last_modified)],
        );
        let verdict = evaluate(at(ONE_DAY_MILLIS / 2), &request, Some(response));
        assert!(verdict.network_request.is_none());
        assert!(verdict.cache_response.is_some());
    }

    #[test]
    fn test_heuristic_freshness_skipped_for_query_urls() {
        let url = "http://example.com/doc?page=2";
        let request = request(url);
        let date = format_http_date(T0);
        let last_modified = format_http_date(T0 - 10 * ONE_DAY_MILLIS);
        let response = cached(url, &[("Date", &date), ("Last-Modified", &last_modified)]);
        let verdict = evaluate(at(ONE_DAY_MILLIS / 2), &request, Some(response));
        // Without the heuristic the entry is immediately stale.
        assert!(verdict.network_request.is_some());
    }

    #[test]
    fn test_heuristic_warning_past_one_day() {
        let request = request_with("http://example.com/doc", "Cache-Control", "max-stale");
        let date = format_http_date(T0);
        let last_modified = format_http_date(T0 - 100 * ONE_DAY_MILLIS);
        let response = cached(
            "http://example.com/doc",
            &[("Date", &date), ("Last-Modified", &last_modified)],
        );
        let verdict = evaluate(at(2 * ONE_DAY_MILLIS), &request, Some(response));
        let served = verdict.cache_response.unwrap();
        assert!(served
            .headers()
            .values("Warning")
            .contains(&"113 hoard \"Heuristic expiration\""));
    }

    #[test]
    fn test_age_header_corrects_apparent_age() {
        let request = request("http://example.com/");
        let date = format_http_date(T0);
        let response = cached(
            "http://example.com/",
            &[
                ("Date", &date),
                ("Age", "500"),
                ("Cache-Control", "max-age=600"),
                ("ETag", "\"a\""),
            ],
        );
        // Only 200s on our clock, but the proxy says it was already 500s
        // old; 500 + 200 > 600.
        let verdict = evaluate(at(200_000), &request, Some(response));
        assert!(verdict.network_request.is_some());
    }

    #[test]
    fn test_response_no_cache_forces_revalidation() {
        let request = request("http://example.com/");
        let date = format_http_date(T0);
        let response = cached(
            "http://example.com/",
            &[
                ("Date", &date),
                ("Cache-Control", "no-cache, max-age=600"),
                ("ETag", "\"a\""),
            ],
        );
        let verdict = evaluate(at(0), &request, Some(response));
        assert!(verdict.network_request.is_some());
        assert!(verdict.cache_response.is_some());
    }

    #[test]
    fn test_is_cacheable_status_codes() {
        let request = request("http://example.com/");
        let test_table = vec![
            (200, true),
            (203, true),
            (204, true),
            (300, true),
            (301, true),
            (308, true),
            (404, true),
            (405, true),
            (410, true),
            (414, true),
            (501, true),
            (201, false),
            (302, false),
            (307, false),
            (500, false),
            (503, false),
        ];
        for (code, expected) in test_table {
            let response = Response::builder()
                .request(request.clone())
                .status(code)
                .build()
                .unwrap();
            assert_eq!(expected, is_cacheable(&response, &request), "code {code}");
        }
    }

    #[test]
    fn test_302_cacheable_with_explicit_expiration() {
        let request = request("http://example.com/");
        for header in [
            ("Expires", "Thu, 01 Jan 2026 00:00:00 GMT"),
            ("Cache-Control", "max-age=60"),
            ("Cache-Control", "public"),
            ("Cache-Control", "private"),
        ] {
            let mut headers = Headers::new();
            headers.add(header.0, header.1);
            let response = Response::builder()
                .request(request.clone())
                .status(302)
                .headers(headers)
                .build()
                .unwrap();
            assert!(is_cacheable(&response, &request), "header {header:?}");
        }
    }

    #[test]
    fn test_no_store_disqualifies_either_side() {
        let plain = request("http://example.com/");
        let mut headers = Headers::new();
        headers.add("Cache-Control", "no-store");
        let response = Response::builder()
            .request(plain.clone())
            .status(200)
            .headers(headers)
            .build()
            .unwrap();
        assert!(!is_cacheable(&response, &plain));

        let no_store_request =
            request_with("http://example.com/", "Cache-Control", "no-store");
        let response = Response::builder()
            .request(plain.clone())
            .status(200)
            .build()
            .unwrap();
        assert!(!is_cacheable(&response, &no_store_request));
    }

    #[test]
    fn test_head_request_method_must_match() {
        // The policy itself doesn't look at methods; the orchestrator's
        // entry matching does. Ensure a GET candidate still yields a GET
        // conditional request untouched.
        let request = Request::builder()
            .url("http://example.com/")
            .method(Method::GET)
            .build()
            .unwrap();
        let date = format_http_date(T0);
        let response = cached(
            "http://example.com/",
            &[("Date", &date), ("Cache-Control", "max-age=0"), ("ETag", "\"a\"")],
        );
        let verdict = evaluate(at(10_000), &request, Some(response));
        assert_eq!(Method::GET, verdict.network_request.unwrap().method());
    }
}
