use chrono::{Days, NaiveDate};
use reqwest::StatusCode;
use serde::{Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

pub mod observability;
pub mod table;

/// Production endpoint of the GridX pricing API.
pub const PRICING_ENDPOINT: &str = "https://pge-pe-api.gridx.com/v1/getPricing";

const UTILITY: &str = "PGE";
const MARKET: &str = "DAM";
const RATE_NAME: &str = "EV2A";
const REPRESENTATIVE_CIRCUIT_ID: &str = "042211101";
const PROGRAM: &str = "CalFUSE";
const CCA: &str = "MCE";

/// Longest error-page excerpt kept in an [`PricingError::HttpStatus`] message.
const MAX_ERROR_BODY_CHARS: usize = 200;

/// Date format the API expects for `startdate` and `enddate`.
const COMPACT_DATE_FORMAT: &str = "%Y%m%d";

/// Either the untyped pricing document or the reason it could not be fetched.
pub type PricingResult = Result<Value, PricingError>;

#[derive(Error, Debug)]
pub enum PricingError {
    #[error("http request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP {}: {}", .status.as_u16(), .body)]
    HttpStatus { status: StatusCode, body: String },
    #[error("pricing response is not valid JSON: {0}")]
    BodyDecode(#[from] serde_json::Error),
    #[error("no pricing published for {0} yet (HTTP 204)")]
    NoContent(NaiveDate),
    #[error("cannot compute the day after {0}")]
    DateOutOfRange(NaiveDate),
}

/// Query parameters of a single `getPricing` request.
///
/// Everything except the two dates is fixed to the PG&E EV2A tariff on
/// circuit `042211101`, CalFUSE program, MCE as CCA. Field order is the
/// order the parameters appear in the query string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PricingQuery {
    utility: &'static str,
    market: &'static str,
    #[serde(rename = "startdate", serialize_with = "serialize_compact_date")]
    start_date: NaiveDate,
    #[serde(rename = "enddate", serialize_with = "serialize_compact_date")]
    end_date: NaiveDate,
    #[serde(rename = "ratename")]
    rate_name: &'static str,
    #[serde(rename = "representativeCircuitId")]
    circuit_id: &'static str,
    program: &'static str,
    cca: &'static str,
}

impl PricingQuery {
    /// Query covering exactly one calendar `day`.
    pub fn for_day(day: NaiveDate) -> Self {
        Self {
            utility: UTILITY,
            market: MARKET,
            start_date: day,
            end_date: day,
            rate_name: RATE_NAME,
            circuit_id: REPRESENTATIVE_CIRCUIT_ID,
            program: PROGRAM,
            cca: CCA,
        }
    }

    /// Query for the day after `today`.
    pub fn tomorrow(today: NaiveDate) -> Result<Self, PricingError> {
        Ok(Self::for_day(tomorrow(today)?))
    }

    pub fn start_date(&self) -> NaiveDate {
        self.start_date
    }

    pub fn end_date(&self) -> NaiveDate {
        self.end_date
    }
}

fn serialize_compact_date<S>(date: &NaiveDate, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_str(&date.format(COMPACT_DATE_FORMAT))
}

/// Returns the calendar day following `today`.
pub fn tomorrow(today: NaiveDate) -> Result<NaiveDate, PricingError> {
    today
        .checked_add_days(Days::new(1))
        .ok_or(PricingError::DateOutOfRange(today))
}

/// Send `query` to `endpoint` and decode the body as JSON.
///
/// Exactly one request is made, with the client's default timeouts and no
/// retry. The document is returned as-is; its shape is checked only when it is
/// rendered.
pub async fn query_pricing(endpoint: &str, query: &PricingQuery) -> PricingResult {
    let result = send_query(endpoint, query).await;
    if let Err(err) = &result {
        tracing::debug!(error = %err, "pricing request failed");
    }
    result
}

async fn send_query(endpoint: &str, query: &PricingQuery) -> PricingResult {
    tracing::debug!(endpoint, day = %query.start_date, "requesting hourly pricing");

    let client = reqwest::Client::new();
    let response = client.get(endpoint).query(query).send().await?;

    let status = response.status();
    if status == StatusCode::NO_CONTENT {
        return Err(PricingError::NoContent(query.start_date));
    }
    if !status.is_success() {
        let body = single_line(&response.text().await.unwrap_or_default());
        let body = if body.is_empty() {
            status.canonical_reason().unwrap_or_default().to_owned()
        } else {
            body
        };
        return Err(PricingError::HttpStatus { status, body });
    }

    let body = response.text().await?;
    Ok(serde_json::from_str(&body)?)
}

/// Collapses whitespace runs (newlines included) into single spaces and caps
/// the result at `MAX_ERROR_BODY_CHARS`.
fn single_line(body: &str) -> String {
    let collapsed = body.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= MAX_ERROR_BODY_CHARS {
        return collapsed;
    }
    let mut truncated: String = collapsed.chars().take(MAX_ERROR_BODY_CHARS).collect();
    truncated.push_str("...");
    truncated
}

/// Fetch pricing for the day after `today` from the production endpoint.
pub async fn fetch_tomorrows_pricing(today: NaiveDate) -> PricingResult {
    let query = PricingQuery::tomorrow(today)?;
    query_pricing(PRICING_ENDPOINT, &query).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    /// Serves `response` to the first connection and hands back its request head.
    async fn serve_once(response: String) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            let _ = tx.send(String::from_utf8_lossy(&head).into_owned());
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        (format!("http://{addr}/v1/getPricing"), rx)
    }

    fn http_response(status_line: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    #[test]
    fn test_tomorrow_crosses_leap_day() {
        assert_eq!(tomorrow(date(2024, 2, 29)).unwrap(), date(2024, 3, 1));
        assert_eq!(tomorrow(date(2024, 2, 28)).unwrap(), date(2024, 2, 29));
        assert_eq!(tomorrow(date(2023, 2, 28)).unwrap(), date(2023, 3, 1));
    }

    #[test]
    fn test_tomorrow_crosses_year() {
        assert_eq!(tomorrow(date(2023, 12, 31)).unwrap(), date(2024, 1, 1));
    }

    #[test]
    fn test_tomorrow_out_of_range() {
        assert!(matches!(
            tomorrow(NaiveDate::MAX),
            Err(PricingError::DateOutOfRange(_))
        ));
    }

    #[test]
    fn test_query_dates_are_equal() {
        let query = PricingQuery::tomorrow(date(2023, 12, 31)).unwrap();

        assert_eq!(query.start_date(), date(2024, 1, 1));
        assert_eq!(query.end_date(), query.start_date());
    }

    #[tokio::test]
    async fn test_query_parameters_on_the_wire() {
        let body = r#"{"data":[]}"#;
        let (endpoint, head) = serve_once(http_response("200 OK", body)).await;

        let query = PricingQuery::tomorrow(date(2024, 2, 29)).unwrap();
        let document = query_pricing(&endpoint, &query).await.unwrap();
        let head = head.await.unwrap();

        assert_eq!(document, serde_json::json!({ "data": [] }));
        assert!(head.starts_with(
            "GET /v1/getPricing?utility=PGE&market=DAM&startdate=20240301&enddate=20240301\
             &ratename=EV2A&representativeCircuitId=042211101&program=CalFUSE&cca=MCE HTTP/1.1"
        ));
    }

    #[tokio::test]
    async fn test_http_error_status_carries_body() {
        let (endpoint, _head) =
            serve_once(http_response("503 Service Unavailable", "upstream down")).await;

        let err = query_pricing(&endpoint, &PricingQuery::for_day(date(2024, 6, 15)))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PricingError::HttpStatus { status, .. } if status == StatusCode::SERVICE_UNAVAILABLE
        ));
        assert_eq!(err.to_string(), "HTTP 503: upstream down");
    }

    #[tokio::test]
    async fn test_http_error_status_without_body() {
        let (endpoint, _head) = serve_once(http_response("404 Not Found", "")).await;

        let err = query_pricing(&endpoint, &PricingQuery::for_day(date(2024, 6, 15)))
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "HTTP 404: Not Found");
    }

    #[tokio::test]
    async fn test_no_content() {
        let (endpoint, _head) =
            serve_once("HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n".to_owned()).await;

        let err = query_pricing(&endpoint, &PricingQuery::for_day(date(2024, 6, 15)))
            .await
            .unwrap_err();

        assert!(matches!(err, PricingError::NoContent(day) if day == date(2024, 6, 15)));
    }

    #[tokio::test]
    async fn test_body_is_not_json() {
        let (endpoint, _head) = serve_once(http_response("200 OK", "<html>oops</html>")).await;

        let err = query_pricing(&endpoint, &PricingQuery::for_day(date(2024, 6, 15)))
            .await
            .unwrap_err();

        assert!(matches!(err, PricingError::BodyDecode(_)));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = query_pricing(
            &format!("http://{addr}/v1/getPricing"),
            &PricingQuery::for_day(date(2024, 6, 15)),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, PricingError::Network(_)));
        assert!(err.to_string().starts_with("http request failed: "));
    }

    #[tokio::test]
    async fn test_connection_refused_renders_one_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = query_pricing(
            &format!("http://{addr}/v1/getPricing"),
            &PricingQuery::for_day(date(2024, 6, 15)),
        )
        .await;
        let mut out = Vec::new();
        table::render(&mut out, &result).unwrap();
        let out = String::from_utf8(out).unwrap();

        assert_eq!(out.lines().count(), 1);
        assert!(out.starts_with("An error occurred: http request failed: "));
        assert!(!out.contains("---"));
    }

    #[tokio::test]
    async fn test_multi_line_error_page_renders_one_line() {
        let page = "<html>\n<body>\n<h1>502 Bad Gateway</h1>\n</body>\n</html>\n";
        let (endpoint, _head) = serve_once(http_response("502 Bad Gateway", page)).await;

        let result = query_pricing(&endpoint, &PricingQuery::for_day(date(2024, 6, 15))).await;
        let mut out = Vec::new();
        table::render(&mut out, &result).unwrap();
        let out = String::from_utf8(out).unwrap();

        assert_eq!(out.lines().count(), 1);
        assert_eq!(
            out,
            "An error occurred: HTTP 502: <html> <body> <h1>502 Bad Gateway</h1> </body> </html>\n"
        );
    }

    #[test]
    fn test_single_line_caps_long_bodies() {
        let body = "x".repeat(500) + "\r\ntrailer";

        let line = single_line(&body);

        assert_eq!(line, format!("{}...", "x".repeat(MAX_ERROR_BODY_CHARS)));
        assert_eq!(single_line(" \n\t "), "");
    }
}
