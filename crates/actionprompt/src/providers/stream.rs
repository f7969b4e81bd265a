//! Server-sent events plumbing shared by the streaming adapters.

use anyhow::{anyhow, Result};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Response;

/// Sentinel some providers send as the last data payload
pub const DONE_SENTINEL: &str = "[DONE]";

/// Drive an SSE response to completion.
///
/// `handler` receives the event name and data payload of each event and
/// returns `Ok(false)` to stop reading early. Events with an empty payload
/// are skipped.
pub async fn for_each_event<H>(response: Response, mut handler: H) -> Result<()>
where
    H: FnMut(&str, &str) -> Result<bool> + Send,
{
    let mut events = response.bytes_stream().eventsource();

    while let Some(event) = events.next().await {
        let event = event.map_err(|e| anyhow!("Stream error: {}", e))?;
        if event.data.is_empty() {
            continue;
        }
        if !handler(event.event.as_str(), event.data.as_str())? {
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn sse_response(body: &'static str) -> (MockServer, Response) {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sse"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&mock_server)
            .await;

        let response = reqwest::get(format!("{}/sse", mock_server.uri()))
            .await
            .unwrap();
        (mock_server, response)
    }

    #[tokio::test]
    async fn test_passes_event_name_and_data() -> Result<()> {
        let (_server, response) = sse_response(concat!(
            "event: token\n",
            "data: hello\n",
            "\n",
            "event: done\n",
            "data: world\n",
            "\n",
        ))
        .await;

        let mut seen = Vec::new();
        for_each_event(response, |event, data| {
            seen.push((event.to_string(), data.to_string()));
            Ok(true)
        })
        .await?;

        assert_eq!(
            seen,
            vec![
                ("token".to_string(), "hello".to_string()),
                ("done".to_string(), "world".to_string()),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_stops_when_handler_returns_false() -> Result<()> {
        let (_server, response) = sse_response(concat!(
            "data: one\n\n",
            "data: [DONE]\n\n",
            "data: never\n\n",
        ))
        .await;

        let mut seen = Vec::new();
        for_each_event(response, |_, data| {
            if data == DONE_SENTINEL {
                return Ok(false);
            }
            seen.push(data.to_string());
            Ok(true)
        })
        .await?;

        assert_eq!(seen, vec!["one"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let (_server, response) = sse_response("data: boom\n\n").await;
        let result = for_each_event(response, |_, data| Err(anyhow!("bad chunk {}", data))).await;
        assert_eq!(result.unwrap_err().to_string(), "bad chunk boom");
    }
}
