//! Worker-thread wrapper: bounded input queues in, optional output queues
//! out, one estimator loop in between.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::info;

use super::messages::{MargData, OpticalFlowResult, StateSnapshot, VisualizationData};
use crate::calib::Calibration;
use crate::config::VioConfig;
use crate::estimator::VioEstimator;
use crate::imu::ImuData;

/// Capacity of the vision input queue; producers block when it is full.
pub const VISION_QUEUE_CAPACITY: usize = 10;

/// Capacity of the IMU input queue.
pub const IMU_QUEUE_CAPACITY: usize = 300;

/// Optional sinks. Every queue receives a `None` sentinel on shutdown.
#[derive(Default)]
pub struct OutputQueues {
    pub state: Option<Sender<Option<StateSnapshot>>>,
    pub visualization: Option<Sender<Option<VisualizationData>>>,
    pub marginalization: Option<Sender<Option<MargData>>>,
}

/// Handle to a running estimator worker.
pub struct VioSystem {
    vision_tx: Sender<Option<Arc<OpticalFlowResult>>>,
    imu_tx: Sender<Option<ImuData>>,
    finished: Arc<AtomicBool>,
    last_state: Arc<Mutex<Option<StateSnapshot>>>,
    handle: Option<JoinHandle<()>>,
}

impl VioSystem {
    pub fn spawn(calib: Calibration, config: VioConfig, outputs: OutputQueues) -> Result<Self> {
        let (vision_tx, vision_rx) = bounded(VISION_QUEUE_CAPACITY);
        let (imu_tx, imu_rx) = bounded(IMU_QUEUE_CAPACITY);
        let finished = Arc::new(AtomicBool::new(false));
        let last_state: Arc<Mutex<Option<StateSnapshot>>> = Arc::new(Mutex::new(None));

        let handle = {
            let finished = finished.clone();
            let last_state = last_state.clone();
            thread::Builder::new()
                .name("vio-estimator".into())
                .spawn(move || {
                    worker_loop(calib, config, outputs, vision_rx, imu_rx, &finished, &last_state)
                })
                .context("failed to spawn estimator thread")?
        };

        Ok(Self {
            vision_tx,
            imu_tx,
            finished,
            last_state,
            handle: Some(handle),
        })
    }

    /// Queue an IMU sample; blocks while the IMU queue is full.
    pub fn push_imu(&self, data: ImuData) {
        let _ = self.imu_tx.send(Some(data));
    }

    /// Queue an image frame's tracks; blocks while the vision queue is full.
    pub fn push_vision(&self, frame: OpticalFlowResult) {
        let _ = self.vision_tx.send(Some(Arc::new(frame)));
    }

    /// Request shutdown: the worker drains up to the sentinel, notifies all
    /// output queues and exits.
    pub fn quit(&self) {
        let _ = self.vision_tx.send(None);
        let _ = self.imu_tx.send(None);
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Most recent published estimate.
    pub fn last_state(&self) -> Option<StateSnapshot> {
        self.last_state.lock().clone()
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for VioSystem {
    fn drop(&mut self) {
        self.quit();
        self.join();
    }
}

fn worker_loop(
    calib: Calibration,
    config: VioConfig,
    outputs: OutputQueues,
    vision_rx: Receiver<Option<Arc<OpticalFlowResult>>>,
    imu_rx: Receiver<Option<ImuData>>,
    finished: &AtomicBool,
    last_state: &Mutex<Option<StateSnapshot>>,
) {
    let enforce_realtime = config.vio_enforce_realtime;
    let mut estimator = VioEstimator::new(calib.clone(), config);

    let correct = |d: ImuData| ImuData {
        t_ns: d.t_ns,
        accel: calib.calib_accel_bias.correct(&d.accel),
        gyro: calib.calib_gyro_bias.correct(&d.gyro),
    };

    // The most recent IMU sample popped but not yet consumed by a frame.
    let mut pending: Option<ImuData> = None;
    let mut shutdown = false;

    while !shutdown {
        let mut frame = match vision_rx.recv() {
            Ok(Some(frame)) => frame,
            Ok(None) | Err(_) => break,
        };

        if enforce_realtime {
            // Drop stale frames: only the newest queued frame is processed.
            let mut stop = false;
            while let Ok(next) = vision_rx.try_recv() {
                match next {
                    Some(newer) => frame = newer,
                    None => {
                        stop = true;
                        break;
                    }
                }
            }
            if stop {
                break;
            }
        }

        // Drain IMU samples up to the frame timestamp; keep the straddling
        // sample for the interval-closure approximation.
        let mut samples: Vec<ImuData> = Vec::new();
        loop {
            let sample = match pending.take() {
                Some(s) => s,
                None => match imu_rx.recv() {
                    Ok(Some(d)) => correct(d),
                    Ok(None) | Err(_) => {
                        shutdown = true;
                        break;
                    }
                },
            };
            if sample.t_ns <= frame.t_ns {
                samples.push(sample);
            } else {
                pending = Some(sample);
                break;
            }
        }
        if shutdown && samples.is_empty() && pending.is_none() {
            // IMU stream ended before this frame could be covered.
            break;
        }

        estimator.process_frame(frame.clone(), &samples, pending.as_ref());

        let snapshot = estimator.state_snapshot();
        *last_state.lock() = Some(snapshot.clone());

        if let Some(queue) = &outputs.state {
            let _ = queue.send(Some(snapshot));
        }
        if let Some(queue) = &outputs.visualization {
            let _ = queue.send(Some(estimator.visualization_data(&frame)));
        }
        let marg_data = estimator.take_marg_data();
        if let Some(queue) = &outputs.marginalization {
            if let Some(data) = marg_data {
                let _ = queue.send(Some(data));
            }
        }
    }

    if let Some(queue) = &outputs.state {
        let _ = queue.send(None);
    }
    if let Some(queue) = &outputs.visualization {
        let _ = queue.send(None);
    }
    if let Some(queue) = &outputs.marginalization {
        let _ = queue.send(None);
    }

    finished.store(true, Ordering::Release);
    info!("estimator worker finished");
}
