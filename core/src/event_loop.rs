// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! A generic single-consumer event loop: a bounded mpsc channel plus a
//! background task that drains it serially. This is the primitive behind
//! spec.md 5's "single-threaded cooperative event loop per coordinator
//! instance" - every mutation of coordinator-owned state happens inside
//! the one task that owns the receiving end.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info};
use tokio::sync::mpsc;

use crate::error::{JobManagerError, Result};

/// Implemented by whatever owns the state an [`EventLoop`] serializes
/// access to. `on_receive` runs on the loop's single consumer task, so it
/// must never block on anything slower than an in-memory operation -
/// dispatch blocking work to `tokio::task::spawn` and post a follow-up
/// event instead.
#[tonic::async_trait]
pub trait EventAction<E: Send + 'static>: Send + Sync {
    async fn on_receive(&self, event: E) -> Result<()>;

    /// Called when `on_receive` returns an error. The default just logs
    /// it; a programming-error class of event (spec.md 4.1's "any other
    /// message") should instead panic from within `on_receive` itself so
    /// the surrounding supervisor can restart the coordinator.
    async fn on_error(&self, error: JobManagerError) {
        error!("Error processing event: {error}");
    }
}

pub struct EventSender<E> {
    name: String,
    sender: mpsc::Sender<E>,
}

// Written by hand rather than `#[derive(Clone)]`: the derive would add an
// `E: Clone` bound even though `mpsc::Sender<E>` is `Clone` regardless of
// whether `E` is, which would needlessly stop event types that aren't
// `Clone` (e.g. ones carrying a oneshot reply sender) from being used.
impl<E> Clone for EventSender<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            sender: self.sender.clone(),
        }
    }
}

impl<E: Send + 'static> EventSender<E> {
    pub async fn post_event(&self, event: E) -> Result<()> {
        self.sender.send(event).await.map_err(|e| {
            JobManagerError::Internal(format!(
                "event loop '{}' is no longer accepting events: {e}",
                self.name
            ))
        })
    }
}

pub struct EventLoop<E: Send + 'static> {
    name: String,
    buffer_size: usize,
    stopped: Arc<AtomicBool>,
    action: Arc<dyn EventAction<E>>,
    sender: mpsc::Sender<E>,
    receiver: Option<mpsc::Receiver<E>>,
}

impl<E: Send + 'static> EventLoop<E> {
    pub fn new(name: String, buffer_size: usize, action: Arc<dyn EventAction<E>>) -> Self {
        let (sender, receiver) = mpsc::channel(buffer_size);
        Self {
            name,
            buffer_size,
            stopped: Arc::new(AtomicBool::new(false)),
            action,
            sender,
            receiver: Some(receiver),
        }
    }

    pub fn get_sender(&self) -> Result<EventSender<E>> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(JobManagerError::Internal(format!(
                "event loop '{}' has been stopped",
                self.name
            )));
        }
        Ok(EventSender {
            name: self.name.clone(),
            sender: self.sender.clone(),
        })
    }

    /// Start the consumer task. Calling this more than once is a
    /// programming error - the receiver is only available the first time.
    pub fn start(&mut self) -> Result<()> {
        let mut receiver = self.receiver.take().ok_or_else(|| {
            JobManagerError::Internal(format!("event loop '{}' already started", self.name))
        })?;
        let name = self.name.clone();
        let action = self.action.clone();
        let stopped = self.stopped.clone();
        let buffer_size = self.buffer_size;

        tokio::task::spawn(async move {
            info!(
                "Event loop '{}' started with buffer size {}",
                name, buffer_size
            );
            while let Some(event) = receiver.recv().await {
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = action.on_receive(event).await {
                    action.on_error(e).await;
                }
            }
            info!("Event loop '{}' stopped", name);
        });

        Ok(())
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}
