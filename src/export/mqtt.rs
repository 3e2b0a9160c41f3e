use anyhow::{anyhow, Context, Result};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use rumqttc::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::{sanitize_segment, Exporter};
use crate::config::MqttSettings;
use crate::engine::ExportBatch;

const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_MQTTS_PORT: u16 = 8883;
const PAYLOAD_ONLINE: &str = "online";
const PAYLOAD_OFFLINE: &str = "offline";

#[derive(Debug, PartialEq, Eq)]
struct MqttEndpoint {
    host: String,
    port: u16,
    use_tls: bool,
}

/// Publishes events for Home Assistant and other MQTT consumers.
///
/// - `{prefix}/{source}/event`: JSON event summary
/// - `{prefix}/{source}/snapshot`: JPEG of the peak frame (retained)
/// - `{prefix}/operator`: operator messages
/// - `{prefix}/status`: `online` / `offline` availability (retained, last will)
pub struct MqttExporter {
    settings: MqttSettings,
    client: Client,
    stopping: Arc<AtomicBool>,
    connection_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttExporter {
    pub fn connect(settings: MqttSettings) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(&settings.broker)?;
        let status_topic = status_topic(&settings.topic_prefix);

        let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        // Snapshots are full JPEG frames.
        options.set_max_packet_size(Some(16 * 1024 * 1024));
        if let Some(user) = &settings.username {
            options.set_credentials(user, settings.password.clone().unwrap_or_default());
        }
        options.set_last_will(LastWill::new(
            &status_topic,
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
            None,
        ));
        if endpoint.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, connection) = Client::new(options, 32);
        let stopping = Arc::new(AtomicBool::new(false));
        let handle = spawn_connection_loop(connection, Arc::clone(&stopping))?;

        client
            .publish(&status_topic, QoS::AtLeastOnce, true, PAYLOAD_ONLINE.as_bytes().to_vec())
            .context("queue MQTT availability message")?;
        log::info!(
            "mqtt: publishing to {}:{} under '{}' (TLS: {}, auth: {})",
            endpoint.host,
            endpoint.port,
            settings.topic_prefix,
            endpoint.use_tls,
            settings.username.is_some()
        );

        Ok(Self {
            settings,
            client,
            stopping,
            connection_handle: Mutex::new(Some(handle)),
        })
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .with_context(|| format!("publish to {}", topic))
    }
}

impl Exporter for MqttExporter {
    fn name(&self) -> &str {
        "mqtt"
    }

    fn export(&self, batch: &ExportBatch) -> Result<()> {
        let base = format!(
            "{}/{}",
            self.settings.topic_prefix,
            sanitize_segment(&batch.source)
        );
        let summary = serde_json::to_vec(&batch.summary())?;
        self.publish(&format!("{}/event", base), summary, false)?;

        if self.settings.publish_snapshot {
            if let Some(lead) = batch.lead_frame() {
                let jpeg = lead.render(batch.annotated).encode_jpeg()?;
                self.publish(&format!("{}/snapshot", base), jpeg, true)?;
            }
        }
        Ok(())
    }

    fn notify_operator(&self, message: &str) -> Result<()> {
        let topic = format!("{}/operator", self.settings.topic_prefix);
        self.publish(&topic, message.as_bytes().to_vec(), false)
    }

    /// Publishes `offline`, disconnects and joins the connection thread. A
    /// failed step is logged and the rest of the teardown still runs.
    fn close(&self) -> Result<()> {
        let status_topic = status_topic(&self.settings.topic_prefix);
        if let Err(e) = self.publish(&status_topic, PAYLOAD_OFFLINE.as_bytes().to_vec(), true) {
            log::warn!("mqtt: could not announce offline status: {:#}", e);
        }
        self.stopping.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.disconnect() {
            log::warn!("mqtt: disconnect failed: {}", e);
        }
        let handle = self
            .connection_handle
            .lock()
            .map_err(|_| anyhow!("mqtt connection handle lock poisoned"))?
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        Ok(())
    }
}

fn spawn_connection_loop(
    mut connection: Connection,
    stopping: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("mqtt-connection".to_string())
        .spawn(move || {
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                    Err(e) => {
                        if stopping.load(Ordering::SeqCst) {
                            break;
                        }
                        // The next iteration reconnects.
                        log::warn!("mqtt: connection error: {}", e);
                        std::thread::sleep(Duration::from_secs(1));
                    }
                }
            }
        })
        .context("spawn MQTT connection thread")
}

fn status_topic(prefix: &str) -> String {
    format!("{}/status", prefix)
}

fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint> {
    let mut use_tls = false;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let default_port = if use_tls {
        DEFAULT_MQTTS_PORT
    } else {
        DEFAULT_MQTT_PORT
    };
    let (host, port) = split_host_port(remainder, default_port)?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str, default_port: u16) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = match rest.strip_prefix(':') {
            Some(port) => port.parse().context("invalid MQTT port")?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }

    match addr.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port.parse().context("invalid MQTT port")?;
            Ok((host.to_string(), port))
        }
        None => Ok((addr.to_string(), default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_endpoints_with_and_without_scheme() {
        assert_eq!(
            parse_mqtt_endpoint("mqtt://broker.local:1884").unwrap(),
            MqttEndpoint {
                host: "broker.local".to_string(),
                port: 1884,
                use_tls: false
            }
        );
        assert_eq!(
            parse_mqtt_endpoint("mqtts://broker.local").unwrap(),
            MqttEndpoint {
                host: "broker.local".to_string(),
                port: 8883,
                use_tls: true
            }
        );
        assert_eq!(
            parse_mqtt_endpoint("[::1]:1883").unwrap(),
            MqttEndpoint {
                host: "::1".to_string(),
                port: 1883,
                use_tls: false
            }
        );
        assert_eq!(parse_mqtt_endpoint("10.0.0.5").unwrap().port, 1883);
    }

    #[test]
    fn close_finishes_teardown_when_the_client_is_gone() {
        let (client, connection) =
            Client::new(MqttOptions::new("peakwatch-test", "127.0.0.1", 1), 1);
        // Without its event loop every client request fails.
        drop(connection);

        let stopping = Arc::new(AtomicBool::new(false));
        let thread_stopping = Arc::clone(&stopping);
        let handle = std::thread::spawn(move || {
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            while !thread_stopping.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
        });
        let exporter = MqttExporter {
            settings: MqttSettings {
                broker: "mqtt://127.0.0.1:1".to_string(),
                topic_prefix: "peakwatch".to_string(),
                client_id: "peakwatch-test".to_string(),
                username: None,
                password: None,
                publish_snapshot: false,
            },
            client,
            stopping,
            connection_handle: Mutex::new(Some(handle)),
        };

        exporter.close().unwrap();
        assert!(exporter.stopping.load(Ordering::SeqCst));
        assert!(exporter.connection_handle.lock().unwrap().is_none());
    }

    #[test]
    fn rejects_bad_endpoints() {
        assert!(parse_mqtt_endpoint("http://broker:1883").is_err());
        assert!(parse_mqtt_endpoint("broker:notaport").is_err());
        assert!(parse_mqtt_endpoint("mqtt://:1883").is_err());
    }
}
