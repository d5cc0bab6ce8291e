//! Remote-debugging protocol wire parsing.
//!
//! Maps raw `Network.*` notifications (method name + JSON params) to typed
//! [`NetworkEvent`]s so any session client can feed the engine's event
//! channel without depending on a particular protocol binding.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use super::types::{ExchangeId, NetworkEvent};

pub const REQUEST_WILL_BE_SENT: &str = "Network.requestWillBeSent";
pub const RESPONSE_RECEIVED: &str = "Network.responseReceived";
pub const LOADING_FINISHED: &str = "Network.loadingFinished";
pub const LOADING_FAILED: &str = "Network.loadingFailed";

/// Notification params that do not match the expected shape.
#[derive(Debug, Error)]
#[error("malformed {method} params: {source}")]
pub struct WireError {
    pub method: &'static str,
    #[source]
    pub source: serde_json::Error,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestWillBeSentParams {
    request_id: String,
    request: RequestPayload,
}

#[derive(Debug, Deserialize)]
struct RequestPayload {
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseReceivedParams {
    request_id: String,
    response: ResponsePayload,
}

#[derive(Debug, Deserialize)]
struct ResponsePayload {
    status: u16,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadingFinishedParams {
    request_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadingFailedParams {
    request_id: String,
    #[serde(default)]
    error_text: String,
}

fn parse<T: DeserializeOwned>(method: &'static str, params: Value) -> Result<T, WireError> {
    serde_json::from_value(params).map_err(|source| WireError { method, source })
}

impl NetworkEvent {
    /// Convert a protocol notification into a lifecycle event.
    ///
    /// Returns `Ok(None)` for methods the engine does not track.
    pub fn from_cdp(method: &str, params: Value) -> Result<Option<Self>, WireError> {
        let event = match method {
            REQUEST_WILL_BE_SENT => {
                let p: RequestWillBeSentParams = parse(REQUEST_WILL_BE_SENT, params)?;
                NetworkEvent::RequestInitiated {
                    id: ExchangeId::new(p.request_id),
                    url: p.request.url,
                }
            }
            RESPONSE_RECEIVED => {
                let p: ResponseReceivedParams = parse(RESPONSE_RECEIVED, params)?;
                NetworkEvent::ResponseReceived {
                    id: ExchangeId::new(p.request_id),
                    status: p.response.status,
                }
            }
            LOADING_FINISHED => {
                let p: LoadingFinishedParams = parse(LOADING_FINISHED, params)?;
                NetworkEvent::LoadFinished {
                    id: ExchangeId::new(p.request_id),
                }
            }
            LOADING_FAILED => {
                let p: LoadingFailedParams = parse(LOADING_FAILED, params)?;
                NetworkEvent::LoadingFailed {
                    id: ExchangeId::new(p.request_id),
                    error_text: p.error_text,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_request_will_be_sent() {
        let event = NetworkEvent::from_cdp(
            REQUEST_WILL_BE_SENT,
            json!({
                "requestId": "1000.12",
                "loaderId": "abc",
                "request": {"url": "https://shopee.tw/api/v4/pdp/get_pc?itemid=5", "method": "GET"},
                "timestamp": 1.5
            }),
        )
        .unwrap();

        assert_eq!(
            event,
            Some(NetworkEvent::RequestInitiated {
                id: "1000.12".into(),
                url: "https://shopee.tw/api/v4/pdp/get_pc?itemid=5".into(),
            })
        );
    }

    #[test]
    fn parses_response_and_finish() {
        let response = NetworkEvent::from_cdp(
            RESPONSE_RECEIVED,
            json!({"requestId": "1", "response": {"status": 200, "url": "x"}}),
        )
        .unwrap();
        assert_eq!(
            response,
            Some(NetworkEvent::ResponseReceived { id: "1".into(), status: 200 })
        );

        let finished =
            NetworkEvent::from_cdp(LOADING_FINISHED, json!({"requestId": "1", "encodedDataLength": 10}))
                .unwrap();
        assert_eq!(finished, Some(NetworkEvent::LoadFinished { id: "1".into() }));
    }

    #[test]
    fn untracked_methods_are_ignored() {
        let event = NetworkEvent::from_cdp("Page.frameNavigated", json!({})).unwrap();
        assert!(event.is_none());
    }

    #[test]
    fn missing_request_id_is_a_wire_error() {
        let err = NetworkEvent::from_cdp(LOADING_FAILED, json!({"errorText": "net::ERR_ABORTED"}))
            .unwrap_err();
        assert_eq!(err.method, LOADING_FAILED);
    }
}
