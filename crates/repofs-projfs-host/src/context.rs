// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-callback request context
//!
//! Each OS callback that goes pending gets a context owning the completion
//! token. The context completes exactly once, translates core errors into
//! OS result codes, enforces the mount's request timeout, and records
//! request timing.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use repofs_core::FsResult;

use crate::os::{CompletionExtra, ErrorCode, ProjectionOs};
use crate::stats::ChannelStats;

pub struct RequestContext {
    os: Arc<dyn ProjectionOs>,
    command_id: i32,
    stats: Arc<ChannelStats>,
    timeout: Duration,
    started: Instant,
    completed: AtomicBool,
}

impl RequestContext {
    pub fn new(
        os: Arc<dyn ProjectionOs>,
        command_id: i32,
        stats: Arc<ChannelStats>,
        timeout: Duration,
    ) -> Arc<RequestContext> {
        Arc::new(RequestContext {
            os,
            command_id,
            stats,
            timeout,
            started: Instant::now(),
            completed: AtomicBool::new(false),
        })
    }

    pub fn command_id(&self) -> i32 {
        self.command_id
    }

    pub fn send_success(&self) {
        self.complete(ErrorCode::SUCCESS, None);
    }

    pub fn send_enumeration_success(&self) {
        self.complete(ErrorCode::SUCCESS, Some(CompletionExtra::Enumeration));
    }

    pub fn send_notification_success(&self) {
        self.complete(ErrorCode::SUCCESS, None);
    }

    pub fn send_error(&self, code: ErrorCode) {
        self.complete(code, None);
    }

    /// Drive a handler future, converting errors (and a blown deadline) into
    /// a completion. Handlers complete the context themselves on success.
    pub async fn catch_errors<F>(self: &Arc<Self>, fut: F)
    where
        F: Future<Output = FsResult<()>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(
                    target: "repofs::projfs",
                    command_id = self.command_id,
                    %err,
                    "request failed"
                );
                self.send_error(ErrorCode::from_fs_error(&err));
            }
            Err(_elapsed) => {
                debug!(
                    target: "repofs::projfs",
                    command_id = self.command_id,
                    "request timed out; load continues in the background"
                );
                self.send_error(ErrorCode::TIMEOUT);
            }
        }
    }

    fn complete(&self, code: ErrorCode, extra: Option<CompletionExtra>) {
        if self.completed.swap(true, Ordering::SeqCst) {
            return;
        }
        let elapsed_us = self.started.elapsed().as_micros() as u64;
        self.stats.total_request_us.fetch_add(elapsed_us, Ordering::Relaxed);
        if let Err(err) = self.os.complete_command(self.command_id, code, extra) {
            // Completion failures are logged but never retried.
            error!(
                target: "repofs::projfs",
                command_id = self.command_id,
                %err,
                "couldn't complete command"
            );
        }
    }
}
