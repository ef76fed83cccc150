/*!
Scripted agent for exercising a Vigil host without real hardware.

Connects over TCP, sends raw or well-formed telemetry lines, and collects
every frame the host pushes back so tests can assert on them.
*/

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

pub struct ScriptedAgent {
    writer: OwnedWriteHalf,
    received: Arc<Mutex<Vec<Value>>>,
    reader_task: JoinHandle<()>,
}

impl ScriptedAgent {
    /// Connect to a host and start collecting inbound frames.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();

        let received = Arc::new(Mutex::new(Vec::new()));
        let collected = received.clone();
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<Value>(&line) {
                    Ok(frame) => collected.lock().unwrap().push(frame),
                    Err(e) => log::warn!("[agent] unparseable frame from host: {e}"),
                }
            }
        });

        Ok(Self { writer, received, reader_task })
    }

    /// Send one line verbatim (newline appended). Lets tests send garbage.
    pub async fn send_raw(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Send one well-formed telemetry report.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_telemetry(
        &mut self,
        device_id: &str,
        cpu: f64,
        ram: f64,
        disk: f64,
        sent: f64,
        received: f64,
        temp: f64,
    ) -> Result<()> {
        let frame = serde_json::json!({
            "deviceID": device_id,
            "cpuUsage": cpu,
            "ramUsagePercent": ram,
            "diskUsagePercent": disk,
            "networkSent": sent,
            "networkReceived": received,
            "virtualTemp": temp,
        });
        self.send_raw(&frame.to_string()).await
    }

    /// Every frame received from the host so far.
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    /// Wait until a frame with the given `type` arrives, polling until the
    /// timeout runs out.
    pub async fn wait_for_frame(&self, frame_type: &str, timeout_ms: u64) -> Option<Value> {
        let start = std::time::Instant::now();
        loop {
            let found = self
                .received
                .lock()
                .unwrap()
                .iter()
                .find(|frame| frame["type"] == frame_type)
                .cloned();
            if found.is_some() {
                return found;
            }
            if start.elapsed() >= Duration::from_millis(timeout_ms) {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Close the agent's side of the connection.
    pub async fn close(mut self) -> Result<()> {
        self.writer.shutdown().await?;
        self.reader_task.abort();
        Ok(())
    }
}
