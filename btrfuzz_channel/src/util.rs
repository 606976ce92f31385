use core::slice;
use std::{
    io::{Read, Write},
    mem,
};

/// Read one plain-old-data message.
pub fn read_exact<T: Default + Sized, R: Read>(mut r: R) -> Result<T, std::io::Error> {
    let mut v = T::default();
    let data = cast_to_mut(&mut v);
    r.read_exact(data)?;
    Ok(v)
}

pub fn write_all<T: Sized, W: Write>(mut w: W, v: &T) -> Result<(), std::io::Error> {
    let data = cast_to(v);
    w.write_all(data)
}

// Only used with the repr(C) integer structs of `message`, which have no padding
// holes and accept any bit pattern.
fn cast_to<T: Sized>(v: &T) -> &[u8] {
    let ptr = (v as *const T).cast::<u8>();
    let len = mem::size_of::<T>();
    unsafe { slice::from_raw_parts(ptr, len) }
}

fn cast_to_mut<T: Sized>(v: &mut T) -> &mut [u8] {
    let ptr = (v as *mut T).cast::<u8>();
    let len = mem::size_of::<T>();
    unsafe { slice::from_raw_parts_mut(ptr, len) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ExecReq;

    #[test]
    fn message_roundtrip_over_buffer() {
        let req = ExecReq {
            magic: 1,
            flags: 2,
            image_size: 3,
        };
        let mut buf = Vec::new();
        write_all(&mut buf, &req).unwrap();
        assert_eq!(buf.len(), 24);
        let back: ExecReq = read_exact(&buf[..]).unwrap();
        assert_eq!((back.magic, back.flags, back.image_size), (1, 2, 3));
        assert!(read_exact::<ExecReq, _>(&buf[..10]).is_err());
    }
}
