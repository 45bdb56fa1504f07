use crate::helpers::{cid_to_str, mapdata_from_pinned_map};
use anyhow::{anyhow, Context};
use aya::maps::{Map, MapData, RingBuf};
use log::{info, warn};
use quicpipe_common::{maps, Cid, CID_LEN};
use std::{os::fd::AsRawFd, time::Duration};
use tokio::{
    io::{unix::AsyncFd, Interest},
    signal,
};

/// A record is the raw cid, anything else is ignored.
pub fn parse_record(data: &[u8]) -> Option<Cid> {
    let bytes: [u8; CID_LEN] = data.try_into().ok()?;
    Some(Cid::new(bytes))
}

/// Registers `inner` with the runtime for read readiness only.
fn readable_fd<T: AsRawFd>(inner: T) -> std::io::Result<AsyncFd<T>> {
    AsyncFd::with_interest(inner, Interest::READABLE)
}

/// Consumer side of the rejected cids ring buffer.
pub struct RejectedReader {
    fd: AsyncFd<RingBuf<MapData>>,
}

impl RejectedReader {
    pub fn new() -> Result<Self, anyhow::Error> {
        let map = mapdata_from_pinned_map("", maps::REJECTED).ok_or(anyhow!(
            "Failed to find map: {} in bpffs, try load program",
            maps::REJECTED
        ))?;
        let ring: RingBuf<_> = Map::RingBuf(map).try_into()?;
        let fd = readable_fd(ring).context("Can't poll the rejected cids ring buffer")?;
        Ok(Self { fd })
    }

    /// Waits for records and passes each cid to `on_cid` until `max` records
    /// were read. Without `max` it only returns on error.
    pub async fn drain<F>(
        &mut self,
        max: Option<usize>,
        mut on_cid: F,
    ) -> Result<usize, anyhow::Error>
    where
        F: FnMut(Cid),
    {
        let mut read = 0;

        if max == Some(0) {
            return Ok(read);
        }

        loop {
            let mut guard = self
                .fd
                .readable_mut()
                .await
                .context("Failed to poll the rejected cids ring buffer")?;
            let ring = guard.get_inner_mut();

            while let Some(item) = ring.next() {
                match parse_record(&item) {
                    Some(cid) => {
                        on_cid(cid);
                        read += 1;
                    }
                    None => warn!("[rejected] Skip record with {} bytes", item.len()),
                }
                if max.is_some_and(|max| read >= max) {
                    return Ok(read);
                }
            }

            guard.clear_ready();
        }
    }
}

/// Prints the rejected cids as they arrive. Stops after `count` records,
/// after `timeout` without reaching the count, or on Ctrl-C.
pub async fn watch(count: Option<usize>, timeout: Option<Duration>) -> Result<(), anyhow::Error> {
    let mut reader = RejectedReader::new()?;
    let print = |cid: Cid| println!("{}", cid_to_str(&cid));

    let drain = async {
        match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, reader.drain(count, print)).await {
                Ok(res) => res.map(Some),
                Err(_) => Ok(None),
            },
            None => reader.drain(count, print).await.map(Some),
        }
    };

    tokio::select! {
        res = drain => match res? {
            Some(read) => info!("[rejected] Read {} records", read),
            None => info!("[rejected] Read deadline expired"),
        },
        _ = signal::ctrl_c() => info!("[rejected] Exiting..."),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ring_fd_wakes_on_data() {
        use std::os::unix::net::UnixDatagram;

        let (rx, tx) = UnixDatagram::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        let fd = readable_fd(rx).unwrap();

        tx.send(&[0xab; CID_LEN]).unwrap();
        let mut guard = fd.readable().await.unwrap();
        let mut buf = [0_u8; 32];
        let len = guard.get_inner().recv(&mut buf).unwrap();
        assert_eq!(parse_record(&buf[..len]), Some(Cid::new([0xab; CID_LEN])));
        guard.clear_ready();
    }

    #[test]
    fn records_are_raw_cids() {
        let data = [0xab_u8; CID_LEN];
        assert_eq!(parse_record(&data), Some(Cid::new(data)));
        assert_eq!(parse_record(&data[..CID_LEN - 1]), None);
        assert_eq!(parse_record(&[0_u8; CID_LEN + 4]), None);
        assert_eq!(parse_record(&[]), None);
    }
}
