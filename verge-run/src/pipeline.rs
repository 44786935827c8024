//! Task wiring for one sensor: listener, processor, snapshot flusher,
//! hot reload, and shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use color_eyre::eyre::{Result, WrapErr};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sweep2::{
    ForegroundFrame, FrameBuilder, FrameSlot, PacketParser, SensorPose, SweepProcessor,
};
use verge_config_data::{secs, TuningRegistry, VergeConfig};
use verge_store::spawn_store_writer;
use verge_types::{wire, RingCalibration, SensorId};

use crate::tap::{spawn_tap_writer, TapHandle};

/// Socket read deadline; bounds cancellation latency.
const READ_DEADLINE: Duration = Duration::from_millis(100);
/// Store queue sized to tolerate about one snapshot interval of lag; a
/// full queue blocks the processor, which is the intended back-pressure.
const STORE_QUEUE_CAPACITY: usize = 8192;
const FOREGROUND_QUEUE_CAPACITY: usize = 100;
/// Parse errors are logged at most this often.
const PARSE_ERROR_LOG_INTERVAL: Duration = Duration::from_secs(1);

fn unix_now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

pub async fn run(cfg: VergeConfig, config_path: PathBuf) -> Result<()> {
    let sensor = SensorId::new(cfg.sensor_id.clone());
    let registry = TuningRegistry::new(cfg.tuning.clone());

    let calibration = match &cfg.calibration_path {
        Some(path) => RingCalibration::from_json_file(path)
            .wrap_err_with(|| format!("loading calibration {}", path.display()))?,
        None => RingCalibration::sr16(),
    };
    let pose = match &cfg.sensor_pose {
        Some(entries) => SensorPose::from_row_major(entries)?,
        None => SensorPose::identity(),
    };

    let (store, store_join) = spawn_store_writer(&cfg.database_path, STORE_QUEUE_CAPACITY)?;

    // Binding is the one fatal socket error; everything later is survived.
    let socket = UdpSocket::bind(&cfg.lidar_udp_addr)
        .await
        .wrap_err_with(|| format!("cannot bind UDP socket {}", cfg.lidar_udp_addr))?;
    info!("listening on {}", socket.local_addr()?);

    let cancel = CancellationToken::new();

    let (tap, tap_join) = match &cfg.tap_output_path {
        Some(path) => {
            let (handle, join) = spawn_tap_writer(path)?;
            (Some(handle), Some(join))
        }
        None => (None, None),
    };

    let mut processor = SweepProcessor::new(
        sensor.clone(),
        registry.clone(),
        calibration.clone(),
        pose,
        store.clone(),
    );
    if let Some(addr) = &cfg.foreground_udp_addr {
        let (fg_tx, fg_rx) = tokio::sync::mpsc::channel(FOREGROUND_QUEUE_CAPACITY);
        processor = processor.with_foreground_tap(fg_tx);
        tokio::spawn(foreground_emitter_task(
            addr.clone(),
            fg_rx,
            cancel.clone(),
        ));
    }
    let processor = Arc::new(processor);

    let slot = FrameSlot::new();

    let listener = tokio::spawn(listener_task(
        socket,
        PacketParser::new(calibration),
        FrameBuilder::new(sensor.clone()),
        slot.clone(),
        tap,
        registry.clone(),
        cancel.clone(),
    ));
    let processor_join = tokio::spawn(processor_task(
        processor.clone(),
        slot.clone(),
        cancel.clone(),
    ));
    let flusher = tokio::spawn(snapshot_flusher_task(
        processor.clone(),
        registry.clone(),
        cancel.clone(),
    ));
    let reloader = tokio::spawn(hot_reload_task(
        registry.clone(),
        config_path,
        cancel.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    cancel.cancel();

    listener.await?;
    processor_join.await?;
    flusher.await?;
    reloader.await?;

    // Final flush: one last snapshot, then drain the writer.
    if let Err(e) = processor.flush_snapshot("final_flush", unix_now_ns()) {
        error!("final snapshot failed: {e}");
    }
    processor.stats().log_summary();
    store.quit();
    match tokio::task::spawn_blocking(move || store_join.join()).await? {
        Ok(result) => result?,
        Err(_) => error!("store writer panicked"),
    }
    if let Some(join) = tap_join {
        let _ = tokio::task::spawn_blocking(move || join.join()).await?;
    }

    info!("verge-run exited cleanly");
    Ok(())
}

/// Receive datagrams, parse inline, and assemble frames. Parsing on the
/// receive task keeps the listener-to-parser path queue-free.
async fn listener_task(
    socket: UdpSocket,
    parser: PacketParser,
    mut builder: FrameBuilder,
    slot: FrameSlot,
    tap: Option<TapHandle>,
    registry: TuningRegistry,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; wire::PACKET_LEN + wire::SEQUENCE_TRAILER_LEN + 64];
    let mut last_parse_error_log: Option<Instant> = None;
    // Data-time clock for stale-frame cleanup: last observed point
    // timestamp plus wall time elapsed since.
    let mut last_data_ns: Option<(i64, Instant)> = None;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let params = registry.current();

        match tokio::time::timeout(READ_DEADLINE, socket.recv_from(&mut buf)).await {
            Err(_deadline) => {}
            Ok(Err(e)) => {
                error!("udp read error: {e}");
                continue;
            }
            Ok(Ok((len, _addr))) => {
                let datagram = &buf[..len];
                if let Some(tap) = &tap {
                    tap.offer(datagram);
                }
                match parser.parse_datagram(datagram) {
                    Ok(parsed) => {
                        builder.set_motor_rpm(parsed.motor_rpm);
                        for pt in parsed.points {
                            last_data_ns = Some((pt.timestamp_ns, Instant::now()));
                            if let Some(frame) = builder.push_point(pt, &params) {
                                debug!(
                                    "frame {} complete: {} points",
                                    frame.frame,
                                    frame.points.len()
                                );
                                slot.publish(frame);
                            }
                        }
                    }
                    Err(e) => {
                        let due = last_parse_error_log
                            .map_or(true, |at| at.elapsed() >= PARSE_ERROR_LOG_INTERVAL);
                        if due {
                            warn!(
                                "datagram parse failed ({} total): {e}",
                                parser.parse_error_count()
                            );
                            last_parse_error_log = Some(Instant::now());
                        }
                    }
                }
            }
        }

        // Cleanup pass for a stalled in-progress frame.
        if let Some((data_ns, at)) = last_data_ns {
            let now_ns = data_ns + at.elapsed().as_nanos() as i64;
            if let Some(frame) = builder.finalize_stale(now_ns, &params) {
                slot.publish(frame);
            }
        }
    }
    info!(
        "listener exiting: {} packets parsed, {} parse errors, {} frames, {} discarded, {} tap drops",
        parser.packets_parsed(),
        parser.parse_error_count(),
        builder.frames_completed(),
        builder.frames_discarded(),
        tap.map(|t| t.dropped_count()).unwrap_or(0)
    );
}

/// Serialises stages 4-9 for this sensor; one frame at a time.
async fn processor_task(
    processor: Arc<SweepProcessor>,
    slot: FrameSlot,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Finish the pending frame, if any, before exiting.
                if let Some(frame) = slot.try_take() {
                    tokio::task::block_in_place(|| processor.process_frame(frame));
                }
                break;
            }
            frame = slot.take() => {
                tokio::task::block_in_place(|| processor.process_frame(frame));
            }
        }
    }
    info!("processor exiting ({} frames dropped at hand-off)", slot.dropped_count());
}

/// Periodic background snapshot flusher; at most one flush per interval.
async fn snapshot_flusher_task(
    processor: Arc<SweepProcessor>,
    registry: TuningRegistry,
    cancel: CancellationToken,
) {
    loop {
        let params = registry.current();
        let pause = if params.background_flush {
            secs(params.flush_interval)
        } else {
            // Disabled; re-check occasionally in case of a hot reload.
            Duration::from_secs(5)
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(pause) => {
                if params.background_flush {
                    if let Err(e) = processor.flush_snapshot("interval", unix_now_ns()) {
                        // Next tick retries.
                        error!("background snapshot failed: {e}");
                    }
                }
            }
        }
    }
}

/// SIGHUP re-reads the config file and swaps the tuning set atomically.
#[cfg(unix)]
async fn hot_reload_task(
    registry: TuningRegistry,
    config_path: PathBuf,
    cancel: CancellationToken,
) {
    let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(signal) => signal,
        Err(e) => {
            error!("cannot install SIGHUP handler: {e}");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = hangup.recv() => {
                match registry.reload_from_file(&config_path) {
                    Ok(()) => info!("tuning hot-reloaded from {}", config_path.display()),
                    // The previous parameter set stays in effect.
                    Err(e) => error!("hot reload rejected: {e}"),
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn hot_reload_task(
    _registry: TuningRegistry,
    _config_path: PathBuf,
    cancel: CancellationToken,
) {
    cancel.cancelled().await;
}

/// Re-emit foreground-only returns in the vendor wire format.
async fn foreground_emitter_task(
    target: String,
    mut rx: tokio::sync::mpsc::Receiver<ForegroundFrame>,
    cancel: CancellationToken,
) {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(e) => {
            error!("foreground emitter cannot open socket: {e}");
            return;
        }
    };
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let packets = wire::foreground_packets(
            &frame.points,
            frame.timestamp_ns.max(0) as u64,
            0,
        );
        for packet in packets {
            if let Err(e) = socket.send_to(&packet.encode(), &target).await {
                warn!("foreground re-emit failed: {e}");
                break;
            }
        }
    }
}
