//! SOAP client for the SRI reception and authorization web services.
//!
//! Submission goes through `validarComprobante` with the JSON envelope as an
//! escaped string parameter; the answer JSON sits in the `respuesta` element.
//! Status queries use `autorizacionComprobante`.

use async_trait::async_trait;
use quick_xml::escape::escape;
use std::time::Duration;

use sri_einv_core::models::DocumentType;

use crate::{
    build_envelope, response, GatewayClient, GatewayError, RetryPolicy, SubmissionReceipt,
};

const RECEPTION_NS: &str = "http://ec.gob.sri.ws.recepcion";
const AUTHORIZATION_NS: &str = "http://ec.gob.sri.ws.autorizacion";
const RESULT_ELEMENT: &str = "respuesta";

#[derive(Debug, Clone)]
pub struct SoapConfig {
    pub reception_url: String,
    pub authorization_url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for SoapConfig {
    fn default() -> Self {
        Self {
            reception_url: "https://celcer.sri.gob.ec/comprobantes-electronicos-ws/RecepcionComprobantesOffline".into(),
            authorization_url: "https://celcer.sri.gob.ec/comprobantes-electronicos-ws/AutorizacionComprobantesOffline".into(),
            connect_timeout: Duration::from_millis(1500),
            request_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Clone)]
pub struct SriSoapClient {
    config: SoapConfig,
    http_client: reqwest::Client,
}

impl SriSoapClient {
    pub fn new(config: SoapConfig) -> Result<Self, GatewayError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| GatewayError::Protocol(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            config,
            http_client,
        })
    }

    pub fn config(&self) -> &SoapConfig {
        &self.config
    }

    async fn call(&self, url: &str, body: String) -> Result<SubmissionReceipt, CallFailure> {
        let resp = self
            .http_client
            .post(url)
            .header("Content-Type", "text/xml; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                let err = GatewayError::Unavailable(e.to_string());
                if e.is_connect() {
                    CallFailure::Retry(err)
                } else {
                    CallFailure::Stop(err)
                }
            })?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| {
            CallFailure::Stop(GatewayError::Unavailable(format!(
                "failed to read gateway answer: {e}"
            )))
        })?;

        if status.is_server_error() && !text.contains("Fault") {
            return Err(CallFailure::Retry(GatewayError::Unavailable(format!(
                "gateway answered {status}"
            ))));
        }
        if !status.is_success() && !status.is_server_error() {
            return Err(CallFailure::Stop(GatewayError::Protocol(format!(
                "gateway answered {status}: {text}"
            ))));
        }

        let raw = extract_result(&text).map_err(CallFailure::Stop)?;
        response::interpret(&raw).map_err(CallFailure::Stop)
    }
}

/// A failed exchange, split by whether sending it again is safe.
#[derive(Debug)]
enum CallFailure {
    /// The request never got through, or the service answered with a
    /// transient failure.
    Retry(GatewayError),
    /// The service may have processed the request.
    Stop(GatewayError),
}

impl CallFailure {
    fn into_error(self) -> GatewayError {
        match self {
            CallFailure::Retry(e) | CallFailure::Stop(e) => e,
        }
    }
}

pub fn build_submit_envelope(payload_json: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:ec="{RECEPTION_NS}">
    <soapenv:Header/>
    <soapenv:Body>
        <ec:validarComprobante>
            <comprobante>{}</comprobante>
        </ec:validarComprobante>
    </soapenv:Body>
</soapenv:Envelope>"#,
        escape(payload_json)
    )
}

pub fn build_status_envelope(access_key: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:ec="{AUTHORIZATION_NS}">
    <soapenv:Header/>
    <soapenv:Body>
        <ec:autorizacionComprobante>
            <claveAccesoComprobante>{}</claveAccesoComprobante>
        </ec:autorizacionComprobante>
    </soapenv:Body>
</soapenv:Envelope>"#,
        escape(access_key)
    )
}

/// Text of the result element, or the fault string of a SOAP fault.
pub fn extract_result(xml: &str) -> Result<String, GatewayError> {
    let doc = roxmltree::Document::parse(xml)
        .map_err(|e| GatewayError::Protocol(format!("malformed SOAP answer: {e}")))?;

    if let Some(fault) = doc
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == "Fault")
    {
        let reason = fault
            .descendants()
            .find(|n| n.is_element() && n.tag_name().name() == "faultstring")
            .and_then(|n| n.text())
            .unwrap_or("unspecified fault");
        return Err(GatewayError::Protocol(format!("SOAP fault: {}", reason.trim())));
    }

    doc.descendants()
        .find(|n| n.is_element() && n.tag_name().name() == RESULT_ELEMENT)
        .and_then(|n| n.text())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::Protocol(format!("missing <{RESULT_ELEMENT}> element")))
}

#[async_trait]
impl GatewayClient for SriSoapClient {
    async fn is_available(&self) -> bool {
        let url = format!("{}?wsdl", self.config.reception_url);
        match self.http_client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "Gateway probe failed");
                false
            }
        }
    }

    async fn submit(
        &self,
        document_type: DocumentType,
        document: &serde_json::Value,
    ) -> Result<SubmissionReceipt, GatewayError> {
        let payload = build_envelope(document_type, document).to_string();
        let body = &build_submit_envelope(&payload);
        let url = self.config.reception_url.as_str();

        // A lost answer is not retried: the document may already be
        // registered, and a second copy would come back as a duplicate.
        let receipt = self
            .config
            .retry
            .run("validarComprobante", move || async move {
                match self.call(url, body.clone()).await {
                    Ok(receipt) => Ok(Ok(receipt)),
                    Err(CallFailure::Retry(e)) => Err(e),
                    Err(CallFailure::Stop(e)) => Ok(Err(e)),
                }
            })
            .await??;

        tracing::info!(
            doc_type = %document_type,
            status = ?receipt.status,
            "Document submitted to SRI"
        );
        Ok(receipt)
    }

    async fn status(&self, access_key: &str) -> Result<SubmissionReceipt, GatewayError> {
        let body = &build_status_envelope(access_key);
        let url = self.config.authorization_url.as_str();
        self.config
            .retry
            .run("autorizacionComprobante", move || async move {
                self.call(url, body.clone()).await.map_err(CallFailure::into_error)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GatewayStatus;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn soap_answer(json: &str) -> String {
        format!(
            r#"<?xml version="1.0"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <ns2:validarComprobanteResponse xmlns:ns2="{RECEPTION_NS}">
      <respuesta>{}</respuesta>
    </ns2:validarComprobanteResponse>
  </soap:Body>
</soap:Envelope>"#,
            escape(json)
        )
    }

    /// Serves one canned HTTP answer per connection and returns the address.
    async fn serve(status: &'static str, body: String, connections: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for _ in 0..connections {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 64 * 1024];
                let _ = socket.read(&mut buf).await;
                let reply = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: text/xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(reply.as_bytes()).await;
            }
        });
        format!("http://{addr}/ws")
    }

    fn client(url: &str) -> SriSoapClient {
        SriSoapClient::new(SoapConfig {
            reception_url: url.to_string(),
            authorization_url: url.to_string(),
            connect_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(2),
            retry: RetryPolicy::new(2, Duration::ZERO),
        })
        .unwrap()
    }

    #[test]
    fn submit_envelope_escapes_the_json() {
        let xml = build_submit_envelope(r#"{"factura":{"a":"<b>&"}}"#);
        assert!(xml.contains("<comprobante>{&quot;factura&quot;"));
        assert!(xml.contains("&lt;b&gt;&amp;"));
        let doc = roxmltree::Document::parse(&xml).unwrap();
        let param = doc
            .descendants()
            .find(|n| n.tag_name().name() == "comprobante")
            .unwrap();
        assert_eq!(param.text(), Some(r#"{"factura":{"a":"<b>&"}}"#));
    }

    #[test]
    fn result_is_read_from_respuesta() {
        let raw = extract_result(&soap_answer(r#"{"status":"RECIBIDA"}"#)).unwrap();
        assert_eq!(raw, r#"{"status":"RECIBIDA"}"#);
    }

    #[test]
    fn soap_fault_is_a_protocol_error() {
        let xml = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body>
            <s:Fault><faultcode>s:Client</faultcode><faultstring>Unmarshalling Error</faultstring></s:Fault>
        </s:Body></s:Envelope>"#;
        assert_eq!(
            extract_result(xml),
            Err(GatewayError::Protocol("SOAP fault: Unmarshalling Error".into()))
        );
    }

    #[test]
    fn missing_result_element() {
        let xml = r#"<Envelope><Body><other/></Body></Envelope>"#;
        assert!(matches!(extract_result(xml), Err(GatewayError::Protocol(_))));
    }

    #[tokio::test]
    async fn submit_reads_authorization() {
        let body = soap_answer(
            r#"{"status":"AUTORIZADO","accessKeyConfirmed":"2011","authorizationNumber":"2011"}"#,
        );
        let url = serve("200 OK", body, 1).await;
        let receipt = client(&url)
            .submit(DocumentType::Invoice, &json!({"access_key": "2011"}))
            .await
            .unwrap();
        assert_eq!(receipt.status, GatewayStatus::Authorized);
        assert_eq!(receipt.access_key_confirmed.as_deref(), Some("2011"));
    }

    #[tokio::test]
    async fn submit_surfaces_rejection() {
        let body = soap_answer(r#"{"status":"DEVUELTA","rejectionReason":"ERROR SECUENCIAL REGISTRADO"}"#);
        let url = serve("200 OK", body, 1).await;
        let err = client(&url)
            .submit(DocumentType::Invoice, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { .. }));
    }

    #[tokio::test]
    async fn closed_port_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let c = client(&format!("http://{addr}/ws"));
        assert!(!c.is_available().await);
        let err = c.submit(DocumentType::Invoice, &json!({})).await.unwrap_err();
        assert!(err.is_transient());
    }

    /// Accepts connections and never answers; returns the URL and the
    /// number of connections seen.
    async fn silent() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 64 * 1024];
                    let _ = socket.read(&mut buf).await;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                });
            }
        });
        (format!("http://{addr}/ws"), seen)
    }

    fn impatient(url: &str) -> SriSoapClient {
        SriSoapClient::new(SoapConfig {
            reception_url: url.to_string(),
            authorization_url: url.to_string(),
            connect_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_millis(100),
            retry: RetryPolicy::new(3, Duration::ZERO),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn unanswered_submission_is_sent_once() {
        let (url, seen) = silent().await;
        let err = impatient(&url)
            .submit(DocumentType::Invoice, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unavailable(_)));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unanswered_status_query_is_retried() {
        let (url, seen) = silent().await;
        let err = impatient(&url).status("123").await.unwrap_err();
        assert!(matches!(err, GatewayError::Unavailable(_)));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn server_errors_are_retried_as_unavailable() {
        let url = serve("503 Service Unavailable", "busy".to_string(), 2).await;
        let err = client(&url).status("123").await.unwrap_err();
        assert!(matches!(err, GatewayError::Unavailable(_)));
    }
}
