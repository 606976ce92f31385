//! Harness side of the channel.
//!
//! Replies are read by a background thread and handed over through an mpsc channel,
//! so every wait on the runner is bounded by a timeout no matter how the peer behaves.
use crate::{
    message::*,
    shm::SharedRegion,
    util::{read_exact, write_all},
    ChannelError, MAP_SIZE,
};
use std::{
    io::{ErrorKind, Read, Write},
    sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender},
    thread,
    time::Duration,
};

enum Event {
    Ready(ReadyMsg),
    Done { status: u32, cover: Option<Vec<u8>> },
    Closed(std::io::Error),
    Bad(String),
}

pub struct Controller {
    writer: Box<dyn Write + Send>,
    events: Receiver<Event>,
    image_region: Option<Box<dyn SharedRegion>>,
    cover_region: Option<Box<dyn SharedRegion>>,
    peer_flags: ChannelFlags,
    ready: bool,
    in_flight: bool,
    snapshot: Box<[u8]>,
}

impl Controller {
    pub fn new<R, W>(
        reader: R,
        writer: W,
        image_region: Option<Box<dyn SharedRegion>>,
        cover_region: Option<Box<dyn SharedRegion>>,
    ) -> Result<Self, ChannelError>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (tx, rx) = channel();
        thread::Builder::new()
            .name("btrfuzz-channel-reader".to_string())
            .spawn(move || read_loop(reader, tx))?;

        Ok(Self {
            writer: Box::new(writer),
            events: rx,
            image_region,
            cover_region,
            peer_flags: 0,
            ready: false,
            in_flight: false,
            snapshot: vec![0; MAP_SIZE].into_boxed_slice(),
        })
    }

    /// Wait for the runner's announcement and check it against ours.
    pub fn wait_ready(&mut self, timeout: Duration) -> Result<(), ChannelError> {
        let msg = match self.events.recv_timeout(timeout) {
            Ok(Event::Ready(msg)) => msg,
            Ok(Event::Done { .. }) => {
                return Err(ChannelError::Protocol("reply before ready".to_string()))
            }
            Ok(ev) => return Err(closed_or_bad(ev)),
            Err(e) => return Err(recv_error(e)),
        };

        if msg.magic != READY_MAGIC {
            return Err(ChannelError::Protocol(format!(
                "bad ready magic: {:#x}",
                msg.magic
            )));
        }
        if msg.version != PROTOCOL_VERSION {
            return Err(ChannelError::Protocol(format!(
                "protocol version mismatch: runner {}, harness {}",
                msg.version, PROTOCOL_VERSION
            )));
        }
        if msg.map_size as usize != MAP_SIZE {
            return Err(ChannelError::Protocol(format!(
                "map size mismatch: runner {}, harness {}",
                msg.map_size, MAP_SIZE
            )));
        }
        if msg.flags & FLAG_SHM_COVER != 0
            && self.cover_region.as_ref().map(|r| r.len() < MAP_SIZE).unwrap_or(true)
        {
            return Err(ChannelError::Protocol(
                "runner shares coverage but no cover region is mapped".to_string(),
            ));
        }

        self.peer_flags = msg.flags;
        self.ready = true;
        log::debug!("runner ready, flags: {:#b}", msg.flags);
        Ok(())
    }

    /// Start one iteration.
    pub fn go(&mut self, image: &[u8]) -> Result<(), ChannelError> {
        if !self.ready {
            return Err(ChannelError::Protocol("runner not ready".to_string()));
        }
        if self.in_flight {
            return Err(ChannelError::Protocol("iteration in flight".to_string()));
        }

        let use_shm = self.peer_flags & FLAG_SHM_IMAGE != 0
            && self
                .image_region
                .as_ref()
                .map(|r| r.len() >= image.len())
                .unwrap_or(false);
        if use_shm {
            if let Some(r) = self.image_region.as_mut() {
                r.as_slice_mut()[..image.len()].copy_from_slice(image);
            }
        }

        let req = ExecReq {
            magic: REQ_MAGIC,
            flags: if use_shm { FLAG_SHM_IMAGE } else { 0 },
            image_size: image.len() as u64,
        };
        self.snapshot.iter_mut().for_each(|c| *c = 0);
        write_all(&mut self.writer, &req)?;
        if !use_shm {
            self.writer.write_all(image)?;
        }
        self.writer.flush()?;
        self.in_flight = true;
        Ok(())
    }

    /// Wait at most `slice` for "done". The coverage snapshot is updated when it arrives.
    pub fn poll_done(&mut self, slice: Duration) -> Result<Option<RunStatus>, ChannelError> {
        if !self.in_flight {
            return Err(ChannelError::Protocol("no iteration in flight".to_string()));
        }

        let (status, cover) = match self.events.recv_timeout(slice) {
            Ok(Event::Done { status, cover }) => (status, cover),
            Ok(Event::Ready(_)) => {
                return Err(ChannelError::Protocol("unexpected ready".to_string()))
            }
            Ok(ev) => return Err(closed_or_bad(ev)),
            Err(RecvTimeoutError::Timeout) => return Ok(None),
            Err(e) => return Err(recv_error(e)),
        };
        self.in_flight = false;

        let status = RunStatus::from_u32(status)
            .ok_or_else(|| ChannelError::Protocol(format!("bad status: {}", status)))?;
        match cover {
            Some(cover) => self.snapshot.copy_from_slice(&cover),
            None => {
                let region = self
                    .cover_region
                    .as_ref()
                    .filter(|_| self.peer_flags & FLAG_SHM_COVER != 0)
                    .ok_or_else(|| ChannelError::Protocol("reply without coverage".to_string()))?;
                self.snapshot.copy_from_slice(&region.as_slice()[..MAP_SIZE]);
            }
        }
        Ok(Some(status))
    }

    /// Coverage of the last finished iteration.
    pub fn coverage(&self) -> &[u8] {
        &self.snapshot
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }
}

fn recv_error(e: RecvTimeoutError) -> ChannelError {
    match e {
        RecvTimeoutError::Timeout => ChannelError::Timeout,
        RecvTimeoutError::Disconnected => ChannelError::Disconnected,
    }
}

fn closed_or_bad(ev: Event) -> ChannelError {
    match ev {
        Event::Closed(e) if e.kind() == ErrorKind::UnexpectedEof => ChannelError::Disconnected,
        Event::Closed(e) => ChannelError::Io(e),
        Event::Bad(msg) => ChannelError::Protocol(msg),
        _ => ChannelError::Protocol("unexpected event".to_string()),
    }
}

fn read_loop<R: Read>(mut r: R, tx: Sender<Event>) {
    let ready: ReadyMsg = match read_exact(&mut r) {
        Ok(msg) => msg,
        Err(e) => {
            let _ = tx.send(Event::Closed(e));
            return;
        }
    };
    if tx.send(Event::Ready(ready)).is_err() {
        return;
    }

    loop {
        let reply: ExecReply = match read_exact(&mut r) {
            Ok(reply) => reply,
            Err(e) => {
                let _ = tx.send(Event::Closed(e));
                return;
            }
        };
        if reply.magic != REPLY_MAGIC {
            let _ = tx.send(Event::Bad(format!("bad reply magic: {:#x}", reply.magic)));
            return;
        }
        let cover = if reply.cover_size != 0 {
            if reply.cover_size as usize != MAP_SIZE {
                let _ = tx.send(Event::Bad(format!("bad cover size: {}", reply.cover_size)));
                return;
            }
            let mut buf = vec![0; MAP_SIZE];
            if let Err(e) = r.read_exact(&mut buf) {
                let _ = tx.send(Event::Closed(e));
                return;
            }
            Some(buf)
        } else {
            None
        };
        if tx
            .send(Event::Done {
                status: reply.status,
                cover,
            })
            .is_err()
        {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{endpoint::RunnerEndpoint, shm::ShmRegion};
    use rand::{rngs::SmallRng, Rng, SeedableRng};
    use shared_memory::ShmemConf;
    use std::{
        net::Shutdown,
        os::unix::net::UnixStream,
        thread::JoinHandle,
    };

    const WAIT: Duration = Duration::from_secs(10);

    fn spawn_runner<F>(stream: UnixStream, f: F) -> JoinHandle<()>
    where
        F: FnOnce(RunnerEndpoint<UnixStream, UnixStream>) + Send + 'static,
    {
        thread::spawn(move || {
            let ep = RunnerEndpoint::new(stream.try_clone().unwrap(), stream);
            f(ep)
        })
    }

    fn controller(stream: UnixStream) -> Controller {
        Controller::new(stream.try_clone().unwrap(), stream, None, None).unwrap()
    }

    fn wait_done(ctl: &mut Controller) -> Result<RunStatus, ChannelError> {
        loop {
            if let Some(s) = ctl.poll_done(Duration::from_millis(100))? {
                return Ok(s);
            }
        }
    }

    /// Echo runner: bumps one slot per image byte value and reports Normal.
    fn echo(mut ep: RunnerEndpoint<UnixStream, UnixStream>) {
        ep.ready().unwrap();
        while let Some(image) = ep.wait_go().unwrap() {
            assert!(ep.cover().iter().all(|c| *c == 0));
            for b in &image {
                ep.cover_mut()[*b as usize] = 1;
            }
            ep.done(RunStatus::Normal).unwrap();
        }
    }

    #[test]
    fn ping_pong() {
        let (a, b) = UnixStream::pair().unwrap();
        let runner = spawn_runner(b, echo);
        let hangup = a.try_clone().unwrap();
        let mut ctl = controller(a);
        ctl.wait_ready(WAIT).unwrap();

        let mut rng = SmallRng::from_entropy();
        for _ in 0..16 {
            let len = rng.gen_range(1..4096);
            let image = (0..len).map(|_| rng.gen::<u8>()).collect::<Vec<_>>();
            ctl.go(&image).unwrap();
            assert!(matches!(ctl.go(&image), Err(ChannelError::Protocol(_))));
            assert_eq!(wait_done(&mut ctl).unwrap(), RunStatus::Normal);
            for b in &image {
                assert_eq!(ctl.coverage()[*b as usize], 1);
            }
            let hit = ctl.coverage().iter().filter(|c| **c != 0).count();
            let mut distinct = image.clone();
            distinct.sort_unstable();
            distinct.dedup();
            assert_eq!(hit, distinct.len());
        }

        hangup.shutdown(Shutdown::Both).unwrap();
        runner.join().unwrap();
    }

    #[test]
    fn ready_timeout() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut ctl = controller(a);
        assert!(matches!(
            ctl.wait_ready(Duration::from_millis(50)),
            Err(ChannelError::Timeout)
        ));
    }

    #[test]
    fn silent_runner() {
        let (a, b) = UnixStream::pair().unwrap();
        let runner = spawn_runner(b, |mut ep| {
            ep.ready().unwrap();
            // swallow the request and never answer
            let _ = ep.wait_go();
            thread::sleep(Duration::from_millis(500));
        });
        let mut ctl = controller(a);
        ctl.wait_ready(WAIT).unwrap();
        ctl.go(b"image").unwrap();
        assert!(ctl.poll_done(Duration::from_millis(100)).unwrap().is_none());
        assert!(ctl.in_flight());
        runner.join().unwrap();
        assert!(matches!(wait_done(&mut ctl), Err(ChannelError::Disconnected)));
    }

    #[test]
    fn version_mismatch() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let msg = ReadyMsg {
            magic: READY_MAGIC,
            version: PROTOCOL_VERSION + 1,
            map_size: MAP_SIZE as u32,
            flags: 0,
        };
        write_all(&mut b, &msg).unwrap();
        let mut ctl = controller(a);
        assert!(matches!(ctl.wait_ready(WAIT), Err(ChannelError::Protocol(_))));
    }

    #[test]
    fn garbage_reply() {
        let (a, b) = UnixStream::pair().unwrap();
        let runner = spawn_runner(b, |mut ep| {
            ep.ready().unwrap();
            let _ = ep.wait_go().unwrap();
            let mut s = ep_output(ep);
            s.write_all(&[0xff; 64]).unwrap();
        });
        let mut ctl = controller(a);
        ctl.wait_ready(WAIT).unwrap();
        ctl.go(b"image").unwrap();
        assert!(matches!(wait_done(&mut ctl), Err(ChannelError::Protocol(_))));
        runner.join().unwrap();
    }

    fn ep_output(ep: RunnerEndpoint<UnixStream, UnixStream>) -> UnixStream {
        ep.into_parts().1
    }

    #[test]
    fn shared_regions() {
        let id = format!("btrfuzz-test-{}", std::process::id());
        let img_host = ShmemConf::new()
            .os_id(format!("{}-in", id))
            .size(1 << 20)
            .create()
            .unwrap();
        let cov_host = ShmemConf::new()
            .os_id(format!("{}-cov", id))
            .size(MAP_SIZE)
            .create()
            .unwrap();
        // raw mappings are not Send, wrap them before handing them to the runner thread
        let img_guest = ShmRegion::new(ShmemConf::new().os_id(img_host.get_os_id()).open().unwrap());
        let cov_guest = ShmRegion::new(ShmemConf::new().os_id(cov_host.get_os_id()).open().unwrap());

        let (a, b) = UnixStream::pair().unwrap();
        let runner = thread::spawn(move || {
            let ep = RunnerEndpoint::new(b.try_clone().unwrap(), b)
                .with_regions(
                    Some(Box::new(img_guest)),
                    Some(Box::new(cov_guest)),
                )
                .unwrap();
            echo(ep)
        });
        let hangup = a.try_clone().unwrap();
        let mut ctl = Controller::new(
            a.try_clone().unwrap(),
            a,
            Some(Box::new(ShmRegion::new(img_host))),
            Some(Box::new(ShmRegion::new(cov_host))),
        )
        .unwrap();
        ctl.wait_ready(WAIT).unwrap();

        for image in [&[1_u8, 2, 3][..], &[7, 7][..]].iter() {
            ctl.go(image).unwrap();
            assert_eq!(wait_done(&mut ctl).unwrap(), RunStatus::Normal);
            assert_eq!(ctl.coverage().iter().filter(|c| **c != 0).count(), {
                let mut d = image.to_vec();
                d.dedup();
                d.len()
            });
        }
        // larger than the region, falls back to streaming
        let big = vec![9_u8; (1 << 20) + 1];
        ctl.go(&big).unwrap();
        assert_eq!(wait_done(&mut ctl).unwrap(), RunStatus::Normal);
        assert_eq!(ctl.coverage()[9], 1);

        hangup.shutdown(Shutdown::Both).unwrap();
        runner.join().unwrap();
    }
}
