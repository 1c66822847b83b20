use crate::metrics::{ChannelKind, Metrics};
use aya::maps::{MapData, ring_buf::RingBuf};
use log::{debug, info, trace, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tuner_ebpf_common::{CommRecord, EventKind, PrefetchEvent, TunerEvent};

/// A record taken off one of the channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    Comm(CommRecord),
    Event(TunerEvent),
    Prefetch(PrefetchEvent),
}

pub fn decode(channel: ChannelKind, data: &[u8]) -> Option<Decoded> {
    match channel {
        ChannelKind::Comm => CommRecord::parse(data).map(Decoded::Comm),
        ChannelKind::Events => TunerEvent::parse(data).map(Decoded::Event),
        ChannelKind::Prefetch => PrefetchEvent::parse(data).map(Decoded::Prefetch),
    }
}

/// Decodes, counts and logs one record. Returns the record unless it failed
/// to decode or was sampled out.
pub fn dispatch(
    channel: ChannelKind,
    data: &[u8],
    metrics: &Metrics,
    rate_cap: u64,
) -> Option<Decoded> {
    let Some(record) = decode(channel, data) else {
        metrics.inc_decode_failure();
        debug!(
            "[tunerd] undecodable {} byte record on {:?}",
            data.len(),
            channel
        );
        return None;
    };

    match record {
        Decoded::Comm(CommRecord::Wake { .. }) => metrics.inc_wake(),
        Decoded::Comm(CommRecord::FutexOp { .. }) => metrics.inc_futex_op(),
        Decoded::Event(_) => metrics.inc_spike(),
        Decoded::Prefetch(_) => metrics.inc_prefetch(),
    }

    if !metrics.record(rate_cap, channel) {
        return None;
    }

    match &record {
        Decoded::Comm(CommRecord::Wake {
            waker_tid,
            wakee_tid,
        }) => trace!("[comm] wake {waker_tid} -> {wakee_tid}"),
        Decoded::Comm(CommRecord::FutexOp { uaddr, tid, op }) => {
            trace!("[comm] futex tid={tid} uaddr={uaddr:#x} op={op}")
        }
        Decoded::Event(ev) => {
            let label = match ev.event_kind() {
                Some(EventKind::FutexSpike) => "futex",
                Some(EventKind::FutexWaitvSpike) => "futex_waitv",
                None => "unknown",
            };
            info!(
                "[event] {label} spike tgid={} wait={}us",
                ev.tgid, ev.value_us
            );
        }
        Decoded::Prefetch(ev) => trace!(
            "[prefetch] tgid={} tid={} dev={} ino={} pgoff={}",
            ev.tgid,
            ev.tid,
            ev.sb_dev,
            ev.ino,
            ev.pgoff
        ),
    }
    Some(record)
}

/// Drains `ring` whenever its fd turns readable. `retry` paces the loop
/// after a failed readiness wait.
pub fn start_ring_listener(
    ring: RingBuf<MapData>,
    channel: ChannelKind,
    metrics: Arc<Metrics>,
    rate_cap: u64,
    retry: Duration,
) {
    info!("[tunerd] Starting listener for {channel:?} ring buffer...");
    tokio::spawn(async move {
        let mut async_ring = match AsyncFd::new(ring) {
            Ok(fd) => fd,
            Err(e) => {
                log::error!("failed to create AsyncFd for {channel:?} ring buffer: {e}");
                return;
            }
        };

        loop {
            let mut ready = match async_ring.readable_mut().await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!("{channel:?} ring buffer readable wait failed: {e}");
                    tokio::time::sleep(retry).await;
                    continue;
                }
            };

            let ring = ready.get_inner_mut();
            let mut drained = 0usize;
            while let Some(item) = ring.next() {
                drained += 1;
                dispatch(channel, &item, &metrics, rate_cap);
            }
            if drained == 0 {
                metrics.inc_empty_poll();
            }
            ready.clear_ready();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tuner_ebpf_common::{WakeRecord, comm_kind};

    #[test]
    fn wake_records_are_counted_and_returned() {
        let metrics = Metrics::new();
        let rec = WakeRecord {
            kind: comm_kind::WAKE,
            _pad: 0,
            waker_tid: 1,
            wakee_tid: 2,
        };
        let out = dispatch(ChannelKind::Comm, bytemuck::bytes_of(&rec), &metrics, 0);
        assert_eq!(
            out,
            Some(Decoded::Comm(CommRecord::Wake {
                waker_tid: 1,
                wakee_tid: 2
            }))
        );
        assert_eq!(metrics.snapshot().wake_records, 1);
    }

    #[test]
    fn short_records_count_as_decode_failures() {
        let metrics = Metrics::new();
        assert!(dispatch(ChannelKind::Events, &[1, 2, 3], &metrics, 0).is_none());
        assert!(dispatch(ChannelKind::Prefetch, &[], &metrics, 0).is_none());
        assert_eq!(metrics.decode_failures(), 2);
    }

    #[test]
    fn spikes_survive_rate_limiting() {
        let metrics = Metrics::new();
        let ev = TunerEvent {
            tgid: 9,
            kind: EventKind::FutexSpike as u32,
            value_us: 6000,
            ts_ns: 1,
        };
        for _ in 0..20 {
            assert!(dispatch(ChannelKind::Events, bytemuck::bytes_of(&ev), &metrics, 1).is_some());
        }
        assert_eq!(metrics.snapshot().spike_events, 20);
    }
}
