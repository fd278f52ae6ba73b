/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::connection::port::DevicePort;
use crate::error::{Error, Result};

/// Scripted port for exercising the protocol engines without hardware.
///
/// Reads are served from a queue of response chunks: `read_available` pops
/// one whole chunk per call (an empty queue reads as "nothing pending", i.e.
/// a timeout at the call site), while `read_exact` drains bytes across chunk
/// boundaries and fails once the script runs dry. Every `write_all` is
/// captured for assertions.
pub struct MockPort {
    reads: Arc<Mutex<VecDeque<Vec<u8>>>>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    open: bool,
    /// Number of upcoming `open` calls that should fail.
    fail_opens: Arc<Mutex<usize>>,
    opens: Arc<Mutex<usize>>,
}

impl MockPort {
    pub fn new() -> Self {
        MockPort {
            reads: Arc::new(Mutex::new(VecDeque::new())),
            writes: Arc::new(Mutex::new(Vec::new())),
            open: false,
            fail_opens: Arc::new(Mutex::new(0)),
            opens: Arc::new(Mutex::new(0)),
        }
    }

    /// Queues one response chunk, returned by a single future read call.
    pub fn queue_read(&self, data: &[u8]) {
        self.reads.lock().unwrap().push_back(data.to_vec());
    }

    /// Makes the next `n` calls to `open` fail.
    pub fn fail_next_opens(&self, n: usize) {
        *self.fail_opens.lock().unwrap() = n;
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().unwrap().clear();
    }

    /// How many times `open` has been called, counting failures.
    pub fn open_count(&self) -> usize {
        *self.opens.lock().unwrap()
    }

    /// Handles to the shared read/write scripts, for tests that need to keep
    /// driving the mock after handing it to an engine.
    pub fn handles(&self) -> MockPortHandle {
        MockPortHandle {
            reads: self.reads.clone(),
            writes: self.writes.clone(),
            fail_opens: self.fail_opens.clone(),
            opens: self.opens.clone(),
        }
    }
}

impl Default for MockPort {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable view over a [`MockPort`]'s scripts.
#[derive(Clone)]
pub struct MockPortHandle {
    reads: Arc<Mutex<VecDeque<Vec<u8>>>>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_opens: Arc<Mutex<usize>>,
    opens: Arc<Mutex<usize>>,
}

impl MockPortHandle {
    pub fn queue_read(&self, data: &[u8]) {
        self.reads.lock().unwrap().push_back(data.to_vec());
    }

    pub fn fail_next_opens(&self, n: usize) {
        *self.fail_opens.lock().unwrap() = n;
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn open_count(&self) -> usize {
        *self.opens.lock().unwrap()
    }
}

#[async_trait]
impl DevicePort for MockPort {
    async fn open(&mut self) -> Result<()> {
        *self.opens.lock().unwrap() += 1;

        let mut fail = self.fail_opens.lock().unwrap();
        if *fail > 0 {
            *fail -= 1;
            return Err(Error::conn("Mock port configured to fail open"));
        }

        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        if !self.open {
            return Err(Error::io("Mock port is not open"));
        }
        self.writes.lock().unwrap().push(buf.to_vec());
        Ok(())
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.open {
            return Err(Error::io("Mock port is not open"));
        }

        let mut reads = self.reads.lock().unwrap();
        let mut filled = 0;
        while filled < buf.len() {
            let Some(front) = reads.front_mut() else {
                return Err(Error::io("Mock read script exhausted"));
            };

            let take = front.len().min(buf.len() - filled);
            buf[filled..filled + take].copy_from_slice(&front[..take]);
            front.drain(..take);
            filled += take;

            if front.is_empty() {
                reads.pop_front();
            }
        }

        Ok(filled)
    }

    async fn read_available(&mut self, max: usize) -> Result<Vec<u8>> {
        if !self.open {
            return Err(Error::io("Mock port is not open"));
        }

        let mut reads = self.reads.lock().unwrap();
        let Some(mut front) = reads.pop_front() else {
            return Ok(Vec::new());
        };

        if front.len() > max {
            let rest = front.split_off(max);
            reads.push_front(rest);
        }

        Ok(front)
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn port_name(&self) -> String {
        "mock".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_exact_crosses_chunk_boundaries() {
        let mut port = MockPort::new();
        port.queue_read(&[0x01, 0x02]);
        port.queue_read(&[0x03]);
        port.open().await.unwrap();

        let mut buf = [0u8; 3];
        port.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x01, 0x02, 0x03]);

        // Script is dry now
        let mut more = [0u8; 1];
        assert!(port.read_exact(&mut more).await.is_err());
    }

    #[tokio::test]
    async fn read_available_pops_one_chunk() {
        let mut port = MockPort::new();
        port.queue_read(&[0xAA, 0xBB]);
        port.open().await.unwrap();

        assert_eq!(port.read_available(64).await.unwrap(), vec![0xAA, 0xBB]);
        assert!(port.read_available(64).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn writes_are_captured() {
        let mut port = MockPort::new();
        port.open().await.unwrap();
        port.write_all(&[0xA0]).await.unwrap();
        port.write_all(&[0x0A]).await.unwrap();

        assert_eq!(port.writes(), vec![vec![0xA0], vec![0x0A]]);
    }
}
