//! Modbus RTU over physical serial lines

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use super::frame::{self, EXCEPTION_FLAG};
use super::SerialBus;
use crate::config::{SerialAddress, SerialLineConfig};
use crate::error::TransportError;

/// Silent interval before a request: 3.5 character times, fixed above 19200 baud
pub fn frame_gap(baud_rate: u32) -> Duration {
    if baud_rate == 0 {
        return Duration::from_millis(4);
    }
    if baud_rate > 19_200 {
        return Duration::from_micros(1750);
    }
    // 11 bits per character (start + 8 data + parity + stop)
    let char_time_us = 11_000_000 / u64::from(baud_rate);
    Duration::from_micros(char_time_us * 35 / 10 + 100)
}

struct SerialLine {
    config: SerialLineConfig,
    stream: Option<SerialStream>,
    baud_rate: u32,
}

impl SerialLine {
    fn open(&mut self, baud_rate: u32) -> Result<&mut SerialStream, TransportError> {
        if self.stream.is_none() || self.baud_rate != baud_rate {
            let stream = tokio_serial::new(&self.config.path, baud_rate)
                .data_bits(data_bits(self.config.data_bits))
                .parity(parity(&self.config.parity))
                .stop_bits(stop_bits(self.config.stop_bits))
                .open_native_async()
                .map_err(|e| {
                    TransportError::ConnectionFailed(format!(
                        "open {} @ {}: {}",
                        self.config.path, baud_rate, e
                    ))
                })?;
            info!(port = self.config.port, baud_rate, "Opened serial line {}", self.config.path);
            self.stream = Some(stream);
            self.baud_rate = baud_rate;
        }
        self.stream
            .as_mut()
            .ok_or_else(|| TransportError::Io(format!("{} not open", self.config.path)))
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!(port = self.config.port, "Closed serial line {}", self.config.path);
        }
    }
}

/// [`SerialBus`] speaking Modbus RTU through `tokio-serial`
pub struct RtuSerialBus {
    lines: HashMap<u8, Mutex<SerialLine>>,
}

impl RtuSerialBus {
    pub fn new(lines: &[SerialLineConfig]) -> Self {
        let lines = lines
            .iter()
            .map(|config| {
                (
                    config.port,
                    Mutex::new(SerialLine {
                        config: config.clone(),
                        stream: None,
                        baud_rate: 0,
                    }),
                )
            })
            .collect();
        Self { lines }
    }

    fn line(&self, port: u8) -> Result<&Mutex<SerialLine>, TransportError> {
        self.lines.get(&port).ok_or(TransportError::UnknownLine(port))
    }
}

#[async_trait]
impl SerialBus for RtuSerialBus {
    async fn set_baud_rate(&self, port: u8, baud_rate: u32) -> Result<(), TransportError> {
        let mut line = self.line(port)?.lock().await;
        if let Some(stream) = line.stream.as_mut() {
            if let Err(e) = stream.set_baud_rate(baud_rate) {
                warn!(port, baud_rate, "Baud rate change failed, reopening line: {}", e);
                line.close();
            } else {
                line.baud_rate = baud_rate;
                return Ok(());
            }
        }
        line.open(baud_rate).map(|_| ())
    }

    async fn read_registers(
        &self,
        address: &SerialAddress,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let mut line = self.line(address.port)?.lock().await;
        let baud_rate = if line.baud_rate == 0 {
            address.baud_rate
        } else {
            line.baud_rate
        };

        let result: Result<Vec<u16>, TransportError> = async {
            let stream = line.open(baud_rate)?;
            // drop anything left over from an abandoned transaction
            stream.clear(ClearBuffer::Input)?;
            tokio::time::sleep(frame_gap(baud_rate)).await;

            let request = frame::encode_rtu(address.slave_id, &frame::read_request_pdu(start, count));
            stream.write_all(&request).await?;
            stream.flush().await?;

            read_response(stream, address.slave_id, count).await
        }
        .await;

        if let Err(e) = &result {
            if e.is_connection_fault() {
                line.close();
            }
        }
        result
    }
}

async fn read_response(
    stream: &mut SerialStream,
    slave_id: u8,
    count: u16,
) -> Result<Vec<u16>, TransportError> {
    let mut head = [0u8; 3];
    stream.read_exact(&mut head).await?;

    let mut response = head.to_vec();
    let remaining = if head[1] & EXCEPTION_FLAG != 0 {
        2
    } else {
        usize::from(head[2]) + 2
    };
    let mut tail = vec![0u8; remaining];
    stream.read_exact(&mut tail).await?;
    response.extend_from_slice(&tail);

    frame::check_rtu_crc(&response)?;
    if response[0] != slave_id {
        return Err(TransportError::Codec(format!(
            "response from slave {} while addressing {}",
            response[0], slave_id
        )));
    }
    frame::decode_read_response(&response[1..response.len() - 2], count)
}

fn data_bits(bits: u8) -> tokio_serial::DataBits {
    match bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    }
}

fn parity(parity: &str) -> tokio_serial::Parity {
    match parity.to_ascii_lowercase().as_str() {
        "even" => tokio_serial::Parity::Even,
        "odd" => tokio_serial::Parity::Odd,
        _ => tokio_serial::Parity::None,
    }
}

fn stop_bits(bits: u8) -> tokio_serial::StopBits {
    match bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    }
}
