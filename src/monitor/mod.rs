//! RTC health monitor
//!
//! Media quality is derived from the RTCP traffic the peer connection
//! already produces rather than from a stats polling API: the track drain
//! tasks feed every sender/receiver report and every inbound RTP packet
//! into the [`StatsRegistry`], and the monitor samples the registry on a
//! fixed interval, publishing one [`QualityReport`] per tick.
//!
//! Outbound quality comes from the remote party's receiver reports
//! (fraction lost, interarrival jitter); inbound quality is computed
//! locally (received packet counts against the remote sender reports, and
//! an RFC 3550 jitter estimator over packet arrival times). Streams with
//! no new packets since the previous tick are skipped so silent tracks do
//! not drag averages toward zero.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};
use webrtc::rtcp::packet::Packet as RtcpPacket;
use webrtc::rtcp::receiver_report::ReceiverReport;
use webrtc::rtcp::sender_report::SenderReport;

/// One aggregated media-quality sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityReport {
    /// Worst-direction packet loss rate, 0.0..=1.0
    pub loss_rate: f32,
    /// Worst-direction interarrival jitter in milliseconds
    pub jitter_ms: f32,
}

#[derive(Debug, Clone, Default)]
struct OutboundStream {
    clock_rate: u32,
    /// Latest fraction lost reported by the remote receiver (x/256)
    fraction_lost: u8,
    /// Latest interarrival jitter in RTP clock units
    jitter: u32,
    /// Extended highest sequence number the remote has received
    highest_seq: u32,
}

#[derive(Debug, Clone, Default)]
struct InboundStream {
    clock_rate: u32,
    packets_received: u64,
    /// Cumulative packets the remote claims to have sent (sender reports)
    remote_packets_sent: u64,
    /// RFC 3550 jitter estimator, RTP clock units
    jitter: f64,
    last_transit: Option<f64>,
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    outbound_seq: HashMap<u32, u32>,
    inbound_packets: HashMap<u32, u64>,
    inbound_remote: HashMap<u32, u64>,
}

/// Shared accumulator the drain tasks write into
pub struct StatsRegistry {
    started: Instant,
    outbound: Mutex<HashMap<u32, OutboundStream>>,
    inbound: Mutex<HashMap<u32, InboundStream>>,
    previous: Mutex<Snapshot>,
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            outbound: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
            previous: Mutex::new(Snapshot::default()),
        }
    }

    /// Announce a local sending stream so its reports are interpreted with
    /// the right media clock.
    pub fn register_outbound(&self, ssrc: u32, clock_rate: u32) {
        self.outbound.lock().entry(ssrc).or_default().clock_rate = clock_rate;
    }

    pub fn register_inbound(&self, ssrc: u32, clock_rate: u32) {
        self.inbound.lock().entry(ssrc).or_default().clock_rate = clock_rate;
    }

    pub fn forget_inbound(&self, ssrc: u32) {
        self.inbound.lock().remove(&ssrc);
    }

    /// Feed RTCP read from an RTP sender (remote receiver reports)
    pub fn record_sender_rtcp(&self, packets: &[Box<dyn RtcpPacket + Send + Sync>]) {
        for packet in packets {
            if let Some(rr) = packet.as_any().downcast_ref::<ReceiverReport>() {
                self.apply_receiver_report(rr);
            }
        }
    }

    /// Feed RTCP read from an RTP receiver (remote sender reports)
    pub fn record_receiver_rtcp(&self, packets: &[Box<dyn RtcpPacket + Send + Sync>]) {
        for packet in packets {
            if let Some(sr) = packet.as_any().downcast_ref::<SenderReport>() {
                self.apply_sender_report(sr);
            }
        }
    }

    fn apply_receiver_report(&self, rr: &ReceiverReport) {
        let mut outbound = self.outbound.lock();
        for report in &rr.reports {
            let entry = outbound.entry(report.ssrc).or_default();
            entry.fraction_lost = report.fraction_lost;
            entry.jitter = report.jitter;
            entry.highest_seq = report.last_sequence_number;
            trace!(
                ssrc = report.ssrc,
                fraction_lost = report.fraction_lost,
                "Receiver report"
            );
        }
    }

    fn apply_sender_report(&self, sr: &SenderReport) {
        let mut inbound = self.inbound.lock();
        let entry = inbound.entry(sr.ssrc).or_default();
        entry.remote_packets_sent = u64::from(sr.packet_count);
    }

    /// Count one received RTP packet and update the jitter estimator
    pub fn record_inbound_rtp(&self, ssrc: u32, rtp_timestamp: u32) {
        let arrival = self.started.elapsed().as_secs_f64();
        let mut inbound = self.inbound.lock();
        let entry = inbound.entry(ssrc).or_default();
        entry.packets_received += 1;

        let clock_rate = if entry.clock_rate > 0 {
            f64::from(entry.clock_rate)
        } else {
            return;
        };
        let transit = arrival * clock_rate - f64::from(rtp_timestamp);
        if let Some(last) = entry.last_transit {
            let d = (transit - last).abs();
            entry.jitter += (d - entry.jitter) / 16.0;
        }
        entry.last_transit = Some(transit);
    }

    /// Aggregate one sample since the previous call
    ///
    /// Returns `None` when no stream saw traffic since the last sample.
    pub fn sample(&self) -> Option<QualityReport> {
        let outbound = self.outbound.lock().clone();
        let inbound = self.inbound.lock().clone();
        let mut previous = self.previous.lock();

        let mut out_loss = Vec::new();
        let mut out_jitter = Vec::new();
        for (ssrc, stream) in &outbound {
            let prev_seq = previous.outbound_seq.get(ssrc).copied().unwrap_or(0);
            if stream.highest_seq == prev_seq {
                continue;
            }
            out_loss.push(f32::from(stream.fraction_lost) / 256.0);
            if stream.clock_rate > 0 {
                out_jitter.push(stream.jitter as f32 / stream.clock_rate as f32 * 1000.0);
            }
        }

        let mut in_loss = Vec::new();
        let mut in_jitter = Vec::new();
        for (ssrc, stream) in &inbound {
            let prev_packets = previous.inbound_packets.get(ssrc).copied().unwrap_or(0);
            let received = stream.packets_received.saturating_sub(prev_packets);
            if received == 0 {
                continue;
            }
            let prev_remote = previous.inbound_remote.get(ssrc).copied().unwrap_or(0);
            let sent = stream.remote_packets_sent.saturating_sub(prev_remote);
            if sent > 0 {
                let loss = 1.0 - (received as f32 / sent as f32);
                in_loss.push(loss.clamp(0.0, 1.0));
            }
            if stream.clock_rate > 0 {
                in_jitter.push((stream.jitter / f64::from(stream.clock_rate) * 1000.0) as f32);
            }
        }

        *previous = Snapshot {
            outbound_seq: outbound
                .iter()
                .map(|(ssrc, s)| (*ssrc, s.highest_seq))
                .collect(),
            inbound_packets: inbound
                .iter()
                .map(|(ssrc, s)| (*ssrc, s.packets_received))
                .collect(),
            inbound_remote: inbound
                .iter()
                .map(|(ssrc, s)| (*ssrc, s.remote_packets_sent))
                .collect(),
        };

        if out_loss.is_empty() && in_loss.is_empty() && in_jitter.is_empty() {
            return None;
        }
        Some(QualityReport {
            loss_rate: avg(&out_loss).max(avg(&in_loss)),
            jitter_ms: avg(&out_jitter).max(avg(&in_jitter)),
        })
    }
}

fn avg(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

/// Periodic sampler publishing quality reports on a single-slot channel
///
/// The channel deliberately holds one report: if the consumer lags, stale
/// samples are dropped in favor of the next fresh one.
pub struct RtcMonitor {
    registry: std::sync::Arc<StatsRegistry>,
    interval: Duration,
    reports_tx: mpsc::Sender<QualityReport>,
}

impl RtcMonitor {
    pub fn new(
        registry: std::sync::Arc<StatsRegistry>,
        interval: Duration,
    ) -> (Self, mpsc::Receiver<QualityReport>) {
        let (reports_tx, reports_rx) = mpsc::channel(1);
        (
            Self {
                registry,
                interval,
                reports_tx,
            },
            reports_rx,
        )
    }

    pub async fn run(self, mut close_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = close_rx.changed() => {
                    if *close_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Some(report) = self.registry.sample() {
                        if self.reports_tx.try_send(report).is_err() {
                            debug!("Dropping stale quality report");
                        }
                    }
                }
            }
        }
        debug!("RTC monitor stopped");
    }
}
