//! Runner side of the channel.
use crate::{
    message::*,
    shm::SharedRegion,
    util::{read_exact, write_all},
    ChannelError, MAP_SIZE, MAX_STREAM_IMAGE,
};
use std::io::{ErrorKind, Read, Write};

pub struct RunnerEndpoint<R, W> {
    input: R,
    output: W,
    image_region: Option<Box<dyn SharedRegion>>,
    cover_region: Option<Box<dyn SharedRegion>>,
    local_cover: Box<[u8]>,
}

impl<R: Read, W: Write> RunnerEndpoint<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self {
            input,
            output,
            image_region: None,
            cover_region: None,
            local_cover: vec![0; MAP_SIZE].into_boxed_slice(),
        }
    }

    pub fn into_parts(self) -> (R, W) {
        (self.input, self.output)
    }

    /// Use shared regions for the image and the coverage record.
    pub fn with_regions(
        mut self,
        image: Option<Box<dyn SharedRegion>>,
        cover: Option<Box<dyn SharedRegion>>,
    ) -> Result<Self, ChannelError> {
        if let Some(c) = cover.as_ref() {
            if c.len() < MAP_SIZE {
                return Err(ChannelError::Protocol(format!(
                    "cover region too small: {}",
                    c.len()
                )));
            }
        }
        self.image_region = image;
        self.cover_region = cover;
        Ok(self)
    }

    fn flags(&self) -> ChannelFlags {
        let mut flags = 0;
        if self.image_region.is_some() {
            flags |= FLAG_SHM_IMAGE;
        }
        if self.cover_region.is_some() {
            flags |= FLAG_SHM_COVER;
        }
        flags
    }

    /// Announce protocol version and record size.
    pub fn ready(&mut self) -> Result<(), ChannelError> {
        self.reset_cover();
        let msg = ReadyMsg {
            magic: READY_MAGIC,
            version: PROTOCOL_VERSION,
            map_size: MAP_SIZE as u32,
            flags: self.flags(),
        };
        write_all(&mut self.output, &msg)?;
        self.output.flush()?;
        Ok(())
    }

    /// Block for the next request, `None` once the controller has gone away. The
    /// coverage record is zero when this returns an image.
    pub fn wait_go(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        let req: ExecReq = match read_exact(&mut self.input) {
            Ok(req) => req,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if req.magic != REQ_MAGIC {
            return Err(ChannelError::Protocol(format!(
                "bad request magic: {:#x}",
                req.magic
            )));
        }

        let image = if req.flags & FLAG_SHM_IMAGE != 0 {
            let region = self.image_region.as_ref().ok_or_else(|| {
                ChannelError::Protocol("shm image requested without region".to_string())
            })?;
            let buf = region.as_slice();
            if req.image_size > buf.len() as u64 {
                return Err(ChannelError::Protocol(format!(
                    "image size {} exceeds region",
                    req.image_size
                )));
            }
            buf[..req.image_size as usize].to_vec()
        } else {
            if req.image_size > MAX_STREAM_IMAGE {
                return Err(ChannelError::Protocol(format!(
                    "streamed image too large: {}",
                    req.image_size
                )));
            }
            let mut image = vec![0; req.image_size as usize];
            self.input.read_exact(&mut image)?;
            image
        };

        self.reset_cover();
        Ok(Some(image))
    }

    pub fn cover_mut(&mut self) -> &mut [u8] {
        match self.cover_region.as_mut() {
            Some(r) => &mut r.as_slice_mut()[..MAP_SIZE],
            None => &mut self.local_cover,
        }
    }

    pub fn cover(&self) -> &[u8] {
        match self.cover_region.as_ref() {
            Some(r) => &r.as_slice()[..MAP_SIZE],
            None => &self.local_cover,
        }
    }

    fn reset_cover(&mut self) {
        self.cover_mut().iter_mut().for_each(|c| *c = 0);
    }

    pub fn done(&mut self, status: RunStatus) -> Result<(), ChannelError> {
        let shared = self.cover_region.is_some();
        let reply = ExecReply {
            magic: REPLY_MAGIC,
            status: status.to_u32(),
            cover_size: if shared { 0 } else { MAP_SIZE as u32 },
            pad: 0,
        };
        write_all(&mut self.output, &reply)?;
        if !shared {
            self.output.write_all(&self.local_cover)?;
        }
        self.output.flush()?;
        Ok(())
    }
}
