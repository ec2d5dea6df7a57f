//! Minimal Ogg framing for streaming Opus through an external codec process
//!
//! The writer puts every packet on its own page. The reader reassembles
//! packets from lacing values, so it also accepts pages holding several
//! packets or packets spanning pages.

use bytes::{BufMut, Bytes, BytesMut};
use std::io::{self, Read, Write};

const CAPTURE_PATTERN: &[u8; 4] = b"OggS";
const HEADER_LEN: usize = 27;

const FLAG_CONTINUED: u8 = 0x01;
const FLAG_FIRST: u8 = 0x02;

/// Decoder delay advertised in OpusHead, in 48 kHz samples
pub const OPUS_PRE_SKIP: u16 = 312;

const fn crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut r = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            r = if r & 0x8000_0000 != 0 {
                (r << 1) ^ 0x04C1_1DB7
            } else {
                r << 1
            };
            bit += 1;
        }
        table[i] = r;
        i += 1;
    }
    table
}

static CRC_TABLE: [u32; 256] = crc_table();

fn crc(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |crc, byte| {
        (crc << 8) ^ CRC_TABLE[((crc >> 24) as u8 ^ byte) as usize]
    })
}

/// `OpusHead` identification header, channel mapping family 0
pub fn opus_head(channels: u8, input_sample_rate: u32) -> Bytes {
    let mut head = BytesMut::with_capacity(19);
    head.put_slice(b"OpusHead");
    head.put_u8(1);
    head.put_u8(channels);
    head.put_u16_le(OPUS_PRE_SKIP);
    head.put_u32_le(input_sample_rate);
    head.put_u16_le(0);
    head.put_u8(0);
    head.freeze()
}

pub fn opus_tags() -> Bytes {
    let vendor = b"interview-rtc";
    let mut tags = BytesMut::with_capacity(16 + vendor.len());
    tags.put_slice(b"OpusTags");
    tags.put_u32_le(vendor.len() as u32);
    tags.put_slice(vendor);
    tags.put_u32_le(0);
    tags.freeze()
}

pub fn is_opus_header(packet: &[u8]) -> bool {
    packet.starts_with(b"OpusHead") || packet.starts_with(b"OpusTags")
}

/// Writes one packet per page
pub struct OggPageWriter<W: Write> {
    writer: W,
    serial: u32,
    sequence: u32,
}

impl<W: Write> OggPageWriter<W> {
    pub fn new(writer: W, serial: u32) -> Self {
        Self {
            writer,
            serial,
            sequence: 0,
        }
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Write `packet` as a complete page ending at `granule`
    pub fn write_packet(&mut self, packet: &[u8], granule: u64) -> io::Result<()> {
        let flags = if self.sequence == 0 { FLAG_FIRST } else { 0 };

        // A packet whose length is a multiple of 255 is closed by a zero lacing value
        let mut lacing = vec![255u8; packet.len() / 255];
        lacing.push((packet.len() % 255) as u8);
        if lacing.len() > 255 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} byte packet does not fit one page", packet.len()),
            ));
        }

        let mut page = BytesMut::with_capacity(HEADER_LEN + lacing.len() + packet.len());
        page.put_slice(CAPTURE_PATTERN);
        page.put_u8(0);
        page.put_u8(flags);
        page.put_u64_le(granule);
        page.put_u32_le(self.serial);
        page.put_u32_le(self.sequence);
        page.put_u32_le(0);
        page.put_u8(lacing.len() as u8);
        page.put_slice(&lacing);
        page.put_slice(packet);

        let checksum = crc(&page);
        page[22..26].copy_from_slice(&checksum.to_le_bytes());

        self.sequence += 1;
        self.writer.write_all(&page)?;
        self.writer.flush()
    }
}

/// Yields the packets of a single logical Ogg stream
pub struct OggPacketReader<R: Read> {
    reader: R,
    partial: BytesMut,
    ready: std::collections::VecDeque<Bytes>,
}

impl<R: Read> OggPacketReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            partial: BytesMut::new(),
            ready: Default::default(),
        }
    }

    /// Next complete packet, None at end of stream
    pub fn next_packet(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            if let Some(packet) = self.ready.pop_front() {
                return Ok(Some(packet));
            }
            if !self.read_page()? {
                return Ok(None);
            }
        }
    }

    fn read_page(&mut self) -> io::Result<bool> {
        let mut header = [0u8; HEADER_LEN];
        match self.reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(e),
        }
        if &header[..4] != CAPTURE_PATTERN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "missing OggS capture pattern"));
        }

        let mut lacing = vec![0u8; header[26] as usize];
        self.reader.read_exact(&mut lacing)?;
        let mut body = vec![0u8; lacing.iter().map(|&l| l as usize).sum()];
        self.reader.read_exact(&mut body)?;

        let expected = u32::from_le_bytes([header[22], header[23], header[24], header[25]]);
        header[22..26].fill(0);
        let mut page = Vec::with_capacity(header.len() + lacing.len() + body.len());
        page.extend_from_slice(&header);
        page.extend_from_slice(&lacing);
        page.extend_from_slice(&body);
        if crc(&page) != expected {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "Ogg page checksum mismatch"));
        }

        if header[5] & FLAG_CONTINUED == 0 {
            self.partial.clear();
        }

        let mut offset = 0;
        for len in lacing {
            let len = len as usize;
            self.partial.put_slice(&body[offset..offset + len]);
            offset += len;
            if len < 255 {
                self.ready.push_back(self.partial.split().freeze());
            }
        }
        Ok(true)
    }
}
