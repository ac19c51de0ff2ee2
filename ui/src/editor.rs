use std::sync::mpsc::Receiver;

use crate::state::{ SharedSnapshot, TrainingSnapshot };

/// Mirrors snapshots arriving on the channel into the shared state the
/// widgets render from. Runs on its own thread until the sender hangs up.
pub struct Monitor {
    pub rx: Receiver<TrainingSnapshot>,
    pub snapshot: SharedSnapshot,
}

impl Monitor {
    pub fn listen_and_update(&self) {
        while let Ok(received) = self.rx.recv() {
            if let Ok(mut snapshot) = self.snapshot.lock() {
                *snapshot = received;
            }
        }
    }
}
