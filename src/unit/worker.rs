// src/unit/worker.rs
//! Execution unit thread
//!
//! Each unit is a dedicated OS thread that shares no state with the
//! control loop: requests arrive on a crossbeam channel, events leave on
//! a tokio channel. Encoder calls run behind a panic boundary so no
//! unit-side fault can reach the control thread.

use crate::unit::encoder::{EncodeContext, Encoder};
use crate::unit::protocol::{FailureDetails, UnitEvent, UnitId, UnitRequest};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

/// Spawn a unit thread
///
/// The thread exits when it receives Terminate, when the request channel
/// disconnects, or after reporting a unit fault (the control loop
/// restarts a poisoned unit rather than reusing it).
pub fn spawn_unit(
    id: UnitId,
    encoder: Arc<dyn Encoder>,
    requests: crossbeam_channel::Receiver<UnitRequest>,
    events: UnboundedSender<(UnitId, UnitEvent)>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("pixelpress-unit-{id}"))
        .spawn(move || unit_loop(id, encoder, requests, events))
}

fn unit_loop(
    id: UnitId,
    encoder: Arc<dyn Encoder>,
    requests: crossbeam_channel::Receiver<UnitRequest>,
    events: UnboundedSender<(UnitId, UnitEvent)>,
) {
    debug!("Unit {} thread started", id);

    for request in requests.iter() {
        match request {
            UnitRequest::Init => {
                let capabilities = encoder.capabilities();
                let _ = events.send((id, UnitEvent::Ready { capabilities }));
            }
            UnitRequest::Convert {
                task_id,
                request,
                cancel,
            } => {
                let payload_len = request.payload.len() as u64;

                // A cancel can race the dispatch; skip the encode entirely.
                if cancel.load(Ordering::Relaxed) {
                    let _ = events.send((
                        id,
                        UnitEvent::Error {
                            task_id,
                            message: "task cancelled".to_string(),
                            details: FailureDetails::default(),
                        },
                    ));
                    continue;
                }

                let started = Instant::now();
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    let progress = |pct: f32, message: &str| {
                        let _ = events.send((
                            id,
                            UnitEvent::Progress {
                                task_id,
                                pct,
                                message: message.to_string(),
                            },
                        ));
                    };
                    let ctx = EncodeContext::new(&progress, &cancel);
                    encoder.encode(request, &ctx)
                }));

                let mut unit_fault = false;
                let (event, working_set) = match result {
                    Ok(Ok(output)) => {
                        let working_set = payload_len + output.data.len() as u64;
                        trace!("Unit {} finished task {}", id, task_id);
                        (
                            UnitEvent::Success {
                                task_id,
                                output,
                                processing: started.elapsed(),
                            },
                            working_set,
                        )
                    }
                    Ok(Err(err)) => (
                        UnitEvent::Error {
                            task_id,
                            message: err.message,
                            details: FailureDetails {
                                fatal: err.fatal,
                                unit_fault: false,
                            },
                        },
                        payload_len,
                    ),
                    Err(panic_payload) => {
                        unit_fault = true;
                        let message = panic_message(panic_payload.as_ref());
                        (
                            UnitEvent::Error {
                                task_id,
                                message: format!("encoder panicked: {message}"),
                                details: FailureDetails {
                                    fatal: false,
                                    unit_fault: true,
                                },
                            },
                            payload_len,
                        )
                    }
                };

                let _ = events.send((id, event));
                let _ = events.send((id, UnitEvent::MemoryUsage { bytes: working_set }));

                if unit_fault {
                    // Poisoned encoder state; let the control loop restart us.
                    break;
                }
            }
            UnitRequest::Terminate => break,
        }
    }

    debug!("Unit {} thread exiting", id);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::task::TaskId;
    use crate::unit::encoder::{
        EncodeError, EncodeRequest, EncodedImage, EncoderCapabilities, OutputFormat,
        PassthroughEncoder,
    };
    use bytes::Bytes;
    use std::sync::atomic::AtomicBool;

    struct PanicEncoder;

    impl Encoder for PanicEncoder {
        fn capabilities(&self) -> EncoderCapabilities {
            EncoderCapabilities {
                formats: vec![OutputFormat::Jpeg],
                fallback_mode: false,
            }
        }

        fn encode(
            &self,
            _request: EncodeRequest,
            _ctx: &EncodeContext<'_>,
        ) -> Result<EncodedImage, EncodeError> {
            panic!("codec blew up");
        }
    }

    fn convert_request(task_id: TaskId) -> UnitRequest {
        UnitRequest::Convert {
            task_id,
            request: EncodeRequest::new(Bytes::from_static(b"pixels"), OutputFormat::Jpeg),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    #[tokio::test]
    async fn test_init_then_convert() {
        let (req_tx, req_rx) = crossbeam_channel::unbounded();
        let (evt_tx, mut evt_rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = spawn_unit(1, Arc::new(PassthroughEncoder), req_rx, evt_tx).unwrap();

        req_tx.send(UnitRequest::Init).unwrap();
        let (unit_id, event) = evt_rx.recv().await.unwrap();
        assert_eq!(unit_id, 1);
        assert!(matches!(event, UnitEvent::Ready { .. }));

        let task_id = TaskId::new();
        req_tx.send(convert_request(task_id)).unwrap();

        let mut saw_progress = false;
        loop {
            let (_, event) = evt_rx.recv().await.unwrap();
            match event {
                UnitEvent::Progress { task_id: id, .. } => {
                    assert_eq!(id, task_id);
                    saw_progress = true;
                }
                UnitEvent::Success {
                    task_id: id,
                    output,
                    ..
                } => {
                    assert_eq!(id, task_id);
                    assert_eq!(output.data.as_ref(), b"pixels");
                    break;
                }
                other => panic!("unexpected event: {}", event_name(&other)),
            }
        }
        assert!(saw_progress);

        // Working-set report follows the terminal message.
        let (_, event) = evt_rx.recv().await.unwrap();
        assert!(matches!(event, UnitEvent::MemoryUsage { bytes } if bytes > 0));

        req_tx.send(UnitRequest::Terminate).unwrap();
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_panic_reports_unit_fault_and_exits() {
        let (req_tx, req_rx) = crossbeam_channel::unbounded();
        let (evt_tx, mut evt_rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = spawn_unit(7, Arc::new(PanicEncoder), req_rx, evt_tx).unwrap();

        let task_id = TaskId::new();
        req_tx.send(convert_request(task_id)).unwrap();

        let (_, event) = evt_rx.recv().await.unwrap();
        match event {
            UnitEvent::Error {
                task_id: id,
                message,
                details,
            } => {
                assert_eq!(id, task_id);
                assert!(message.contains("codec blew up"));
                assert!(details.unit_fault);
                assert!(!details.fatal);
            }
            other => panic!("unexpected event: {}", event_name(&other)),
        }

        // Thread terminates itself after a fault.
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_pre_cancelled_convert_is_skipped() {
        let (req_tx, req_rx) = crossbeam_channel::unbounded();
        let (evt_tx, mut evt_rx) = tokio::sync::mpsc::unbounded_channel();
        let _handle = spawn_unit(2, Arc::new(PassthroughEncoder), req_rx, evt_tx).unwrap();

        let task_id = TaskId::new();
        req_tx
            .send(UnitRequest::Convert {
                task_id,
                request: EncodeRequest::new(Bytes::from_static(b"x"), OutputFormat::Png),
                cancel: Arc::new(AtomicBool::new(true)),
            })
            .unwrap();

        let (_, event) = evt_rx.recv().await.unwrap();
        assert!(
            matches!(event, UnitEvent::Error { message, .. } if message.contains("cancelled"))
        );
    }

    fn event_name(event: &UnitEvent) -> &'static str {
        match event {
            UnitEvent::Ready { .. } => "Ready",
            UnitEvent::Progress { .. } => "Progress",
            UnitEvent::Success { .. } => "Success",
            UnitEvent::Error { .. } => "Error",
            UnitEvent::MemoryUsage { .. } => "MemoryUsage",
        }
    }
}
