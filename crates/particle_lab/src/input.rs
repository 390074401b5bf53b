//! External image hand-off
//!
//! A camera (or any producer) submits frames from its own thread; the frame
//! driver takes the newest one at its next encode step. Frames submitted in
//! between replace each other.

use std::sync::{Arc, Mutex};

use image::RgbaImage;

#[derive(Clone, Default)]
pub struct ImageInbox {
    slot: Arc<Mutex<Option<RgbaImage>>>,
}

impl ImageInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a frame, replacing any frame not yet taken
    pub fn submit(&self, image: RgbaImage) {
        let mut slot = match self.slot.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(image);
    }

    /// Remove and return the newest frame, if one arrived since the last take
    pub fn take(&self) -> Option<RgbaImage> {
        match self.slot.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    pub fn has_pending(&self) -> bool {
        match self.slot.lock() {
            Ok(slot) => slot.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }
}
