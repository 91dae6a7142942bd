//! Minimal ONVIF responder.
//!
//! Answers a fixed set of SOAP/XML queries so that ONVIF clients can treat
//! each stream as its own device. Every answer is rendered from the current
//! stream record and the request's `Host`; nothing is cached.

use crate::store::StreamStore;
use crate::streams::{Stream, StreamId};
use std::sync::Arc;
use thiserror::Error;

/// Substring that identifies a `GetStreamUri` request body.
pub const GET_STREAM_URI: &str = "GetStreamUri";

pub const XML_CONTENT_TYPE: &str = "application/xml";
pub const TEXT_CONTENT_TYPE: &str = "text/plain";

/// Host used when the request carries none.
pub const DEFAULT_HOST: &str = "localhost";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResponderError {
    #[error("Stream not found: {0}")]
    NotFound(StreamId),
}

/// A rendered answer. `fault` marks a SOAP fault, served with a server error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub content_type: &'static str,
    pub body: String,
    pub fault: bool,
}

impl Document {
    fn xml(body: String) -> Self {
        Self {
            content_type: XML_CONTENT_TYPE,
            body,
            fault: false,
        }
    }

    fn text(body: String) -> Self {
        Self {
            content_type: TEXT_CONTENT_TYPE,
            body,
            fault: false,
        }
    }
}

pub struct OnvifResponder {
    store: Arc<StreamStore>,
    base_port: u16,
    protocol: String,
}

impl OnvifResponder {
    pub fn new(store: Arc<StreamStore>, base_port: u16, protocol: impl Into<String>) -> Self {
        Self {
            store,
            base_port,
            protocol: protocol.into(),
        }
    }

    async fn lookup(&self, id: StreamId) -> Result<Stream, ResponderError> {
        self.store.get(id).await.ok_or(ResponderError::NotFound(id))
    }

    /// `GetDeviceInformationResponse` for the stream.
    pub async fn device_descriptor(
        &self,
        id: StreamId,
        _host: Option<&str>,
    ) -> Result<Document, ResponderError> {
        let stream = self.lookup(id).await?;
        Ok(Document::xml(render_device_information(&stream)))
    }

    /// Media service WSDL. Does not look the stream up.
    pub fn media_descriptor(&self, id: StreamId, host: Option<&str>) -> Document {
        Document::xml(render_media_wsdl(id, host.unwrap_or(DEFAULT_HOST)))
    }

    /// Answer a media service request. Only `GetStreamUri` is supported;
    /// anything else gets a SOAP fault.
    pub async fn media_query(
        &self,
        id: StreamId,
        body: &str,
        host: Option<&str>,
    ) -> Result<Document, ResponderError> {
        let stream = self.lookup(id).await?;

        if !body.contains(GET_STREAM_URI) {
            return Ok(Document {
                fault: true,
                ..Document::xml(render_fault("Operation not supported"))
            });
        }

        // A stream whose derived port overflows still answers, against the base port.
        let port = stream.relay_port(self.base_port).unwrap_or(self.base_port);
        let uri = format!(
            "{}://{}:{}/stream",
            self.protocol,
            host_name(host.unwrap_or(DEFAULT_HOST)),
            port
        );
        Ok(Document::xml(render_stream_uri(&uri)))
    }

    /// Placeholder acknowledgment; media is served by the relay itself.
    pub async fn stream_redirect(&self, id: StreamId) -> Result<Document, ResponderError> {
        let stream = self.lookup(id).await?;
        Ok(Document::text(format!("RTSP stream for {}", stream.name)))
    }
}

/// Host part of a `Host` header value, without the port.
pub fn host_name(host: &str) -> &str {
    let host = host.trim();
    if host.is_empty() {
        return DEFAULT_HOST;
    }
    if host.starts_with('[') {
        // [v6]:port
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    host.split(':').next().unwrap_or(host)
}

/// Escape the five XML special characters.
pub fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn render_device_information(stream: &Stream) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope" xmlns:tds="http://www.onvif.org/ver10/device/wsdl">
    <soap:Header/>
    <soap:Body>
        <tds:GetDeviceInformationResponse>
            <tds:Manufacturer>CAM Gateway</tds:Manufacturer>
            <tds:Model>{model}</tds:Model>
            <tds:FirmwareVersion>1.0.0</tds:FirmwareVersion>
            <tds:SerialNumber>CAM-{id:04}</tds:SerialNumber>
            <tds:HardwareId>CAM-Gateway-{id}</tds:HardwareId>
        </tds:GetDeviceInformationResponse>
    </soap:Body>
</soap:Envelope>"#,
        model = escape_xml(&stream.name),
        id = stream.id,
    )
}

fn render_media_wsdl(id: StreamId, host: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions name="MediaService" targetNamespace="http://www.onvif.org/ver10/media/wsdl" xmlns:soap="http://schemas.xmlsoap.org/wsdl/soap/" xmlns:xsd="http://www.w3.org/2001/XMLSchema" xmlns="http://schemas.xmlsoap.org/wsdl/" xmlns:tns="http://www.onvif.org/ver10/media/wsdl" xmlns:ter="http://www.onvif.org/ver10/error" xmlns:trt="http://www.onvif.org/ver10/media/wsdl">
    <types>
        <xsd:schema targetNamespace="http://www.onvif.org/ver10/media/wsdl">
            <xsd:element name="GetStreamUri">
                <xsd:complexType>
                    <xsd:sequence>
                        <xsd:element name="StreamSetup" type="trt:StreamSetup"/>
                        <xsd:element name="ProfileToken" type="xsd:token"/>
                    </xsd:sequence>
                </xsd:complexType>
            </xsd:element>
            <xsd:element name="GetStreamUriResponse">
                <xsd:complexType>
                    <xsd:sequence>
                        <xsd:element name="MediaUri" type="trt:MediaUri"/>
                    </xsd:sequence>
                </xsd:complexType>
            </xsd:element>
        </xsd:schema>
    </types>
    <message name="GetStreamUriRequest">
        <part name="parameters" element="tns:GetStreamUri"/>
    </message>
    <message name="GetStreamUriResponse">
        <part name="parameters" element="tns:GetStreamUriResponse"/>
    </message>
    <portType name="Media">
        <operation name="GetStreamUri">
            <input message="tns:GetStreamUriRequest"/>
            <output message="tns:GetStreamUriResponse"/>
        </operation>
    </portType>
    <binding name="MediaBinding" type="tns:Media">
        <soap:binding style="document" transport="http://schemas.xmlsoap.org/soap/http"/>
        <operation name="GetStreamUri">
            <soap:operation soapAction="http://www.onvif.org/ver10/media/wsdl/GetStreamUri"/>
            <input>
                <soap:body use="literal"/>
            </input>
            <output>
                <soap:body use="literal"/>
            </output>
        </operation>
    </binding>
    <service name="Media">
        <port name="MediaPort" binding="tns:MediaBinding">
            <soap:address location="http://{host}/onvif/{id}/media"/>
        </port>
    </service>
</definitions>"#,
        host = escape_xml(host),
        id = id,
    )
}

fn render_stream_uri(uri: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope" xmlns:trt="http://www.onvif.org/ver10/media/wsdl" xmlns:tt="http://www.onvif.org/ver10/schema">
    <soap:Header/>
    <soap:Body>
        <trt:GetStreamUriResponse>
            <trt:MediaUri>
                <tt:Uri>{uri}</tt:Uri>
                <tt:InvalidAfterConnect>false</tt:InvalidAfterConnect>
                <tt:InvalidAfterReboot>false</tt:InvalidAfterReboot>
                <tt:Timeout>PT60S</tt:Timeout>
            </trt:MediaUri>
        </trt:GetStreamUriResponse>
    </soap:Body>
</soap:Envelope>"#,
        uri = escape_xml(uri),
    )
}

fn render_fault(reason: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope">
    <soap:Header/>
    <soap:Body>
        <soap:Fault>
            <soap:Code>
                <soap:Value>soap:Sender</soap:Value>
            </soap:Code>
            <soap:Reason>
                <soap:Text>{reason}</soap:Text>
            </soap:Reason>
        </soap:Fault>
    </soap:Body>
</soap:Envelope>"#,
        reason = escape_xml(reason),
    )
}
