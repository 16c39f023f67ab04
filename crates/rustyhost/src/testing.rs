//! Test doubles shared by the unit tests

use crate::bearer::{Bearer, BearerError, BearerId, BearerResult, SendStatus};
use crate::gap::BdAddr;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Bearer that records everything handed to it
#[derive(Debug, Default)]
pub(crate) struct RecordingBearer {
    sent: Mutex<Vec<(BearerId, Vec<u8>)>>,
    statuses: Mutex<VecDeque<SendStatus>>,
    connects: Mutex<Vec<(BdAddr, u16)>>,
    disconnects: Mutex<Vec<BearerId>>,
    next_id: Mutex<u32>,
    refuse_connect: Mutex<bool>,
}

impl RecordingBearer {
    pub fn new() -> Self {
        Self {
            next_id: Mutex::new(100),
            ..Default::default()
        }
    }

    /// Frames sent so far, clearing the record
    pub fn take_sent(&self) -> Vec<(BearerId, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn take_payloads(&self) -> Vec<Vec<u8>> {
        self.take_sent().into_iter().map(|(_, data)| data).collect()
    }

    /// Status returned by the next `send` calls, in order
    pub fn push_status(&self, status: SendStatus) {
        self.statuses.lock().unwrap().push_back(status);
    }

    pub fn connects(&self) -> Vec<(BdAddr, u16)> {
        self.connects.lock().unwrap().clone()
    }

    pub fn disconnects(&self) -> Vec<BearerId> {
        self.disconnects.lock().unwrap().clone()
    }

    pub fn refuse_connect(&self) {
        *self.refuse_connect.lock().unwrap() = true;
    }
}

impl Bearer for RecordingBearer {
    fn send(&self, id: BearerId, data: &[u8]) -> SendStatus {
        let status = self
            .statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SendStatus::Ok);
        if status == SendStatus::Ok {
            self.sent.lock().unwrap().push((id, data.to_vec()));
        }
        status
    }

    fn connect(&self, peer: BdAddr, psm: u16) -> BearerResult<BearerId> {
        if *self.refuse_connect.lock().unwrap() {
            return Err(BearerError::ConnectFailed("refused".into()));
        }
        self.connects.lock().unwrap().push((peer, psm));
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        Ok(BearerId(*next))
    }

    fn disconnect(&self, id: BearerId) {
        self.disconnects.lock().unwrap().push(id);
    }
}
