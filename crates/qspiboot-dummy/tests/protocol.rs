//! End-to-end protocol scenarios against the emulated hardware
//!
//! Plays the host side of the wire protocol by hand: frames go in
//! through the [`HostPort`], the bootloader runs one cooperative step
//! at a time, and the response stream is parsed back into frames.

use qspiboot_core::crc32;
use qspiboot_core::device::{Bootloader, Flow, Shutdown};
use qspiboot_core::wire::{
    CommandHeader, Opcode, ResponseCode, ResponseHeader, BROADCAST_ID, CRC_LEN, FRAME_MARKER,
    PAGE_SIZE, RESPONSE_HEADER_LEN,
};
use qspiboot_dummy::{uart_pair, DummyBoard, DummyQspi, DummyUart, HostPort};

type Boot = Bootloader<DummyUart, DummyQspi, DummyBoard>;

fn boot_with(qspi: DummyQspi) -> (Boot, HostPort) {
    let (uart, host) = uart_pair();
    let mut boot = Bootloader::new(uart, qspi, DummyBoard::default());
    boot.start().unwrap();
    (boot, host)
}

fn frame(opcode: Opcode, id: u32, params: &[u8]) -> Vec<u8> {
    let mut out = vec![FRAME_MARKER];
    out.extend_from_slice(&CommandHeader::new(opcode, id, params.len() as u32).encode());
    if !params.is_empty() {
        out.extend_from_slice(params);
        out.extend_from_slice(&crc32::checksum(params).to_le_bytes());
    }
    out
}

fn pump(boot: &mut Boot, steps: usize) -> Option<Shutdown> {
    for _ in 0..steps {
        if let Flow::Shutdown(cause) = boot.step() {
            return Some(cause);
        }
    }
    None
}

fn parse_frames(data: &[u8]) -> Vec<(ResponseCode, u32, Vec<u8>)> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let mut raw = [0u8; RESPONSE_HEADER_LEN];
        raw.copy_from_slice(&data[pos..pos + RESPONSE_HEADER_LEN]);
        assert_eq!(raw[0], FRAME_MARKER);
        let hdr = ResponseHeader::decode(&raw);
        assert!(hdr.crc_valid());
        pos += RESPONSE_HEADER_LEN;
        let payload = data[pos..pos + hdr.payload_len as usize].to_vec();
        pos += payload.len();
        if !payload.is_empty() {
            let mut crc_raw = [0u8; CRC_LEN];
            crc_raw.copy_from_slice(&data[pos..pos + CRC_LEN]);
            assert_eq!(u32::from_le_bytes(crc_raw), crc32::checksum(&payload));
            pos += CRC_LEN;
        }
        out.push((hdr.response_code().unwrap(), hdr.transaction_id, payload));
    }
    out
}

fn addr_len_params(addr: u32, len: u32) -> [u8; 8] {
    let mut params = [0u8; 8];
    params[..4].copy_from_slice(&addr.to_le_bytes());
    params[4..].copy_from_slice(&len.to_le_bytes());
    params
}

#[test]
fn boot_announces_online_then_answers_ping() {
    let (mut boot, host) = boot_with(DummyQspi::new_default());
    let frames = parse_frames(&host.receive());
    assert_eq!(frames.len(), 3);
    for (code, id, _) in &frames {
        assert_eq!(*code, ResponseCode::Online);
        assert_eq!(*id, BROADCAST_ID);
    }

    host.send(&frame(Opcode::Ping, 1, &[]));
    assert_eq!(pump(&mut boot, 20), None);
    let frames = parse_frames(&host.receive());
    assert_eq!(frames, [(ResponseCode::Ok, 1, Vec::new())]);
}

#[test]
fn flash_info_matches_the_emulated_chip() {
    let (mut boot, host) = boot_with(DummyQspi::new_default());
    host.receive();
    host.send(&frame(Opcode::FlashInfo, 2, &[]));
    pump(&mut boot, 20);
    let frames = parse_frames(&host.receive());
    assert_eq!(
        frames,
        [(
            ResponseCode::FlashInfo,
            2,
            (1024 * 1024u32).to_le_bytes().to_vec()
        )]
    );
}

#[test]
fn read_flash_and_checksum_agree() {
    let mut qspi = DummyQspi::new_default();
    for (i, slot) in qspi.data_mut()[0x4000..0x4400].iter_mut().enumerate() {
        *slot = (i % 251) as u8;
    }
    let expected = qspi.data()[0x4000..0x4400].to_vec();
    let (mut boot, host) = boot_with(qspi);
    host.receive();

    host.send(&frame(Opcode::ReadFlash, 3, &addr_len_params(0x4000, 0x400)));
    pump(&mut boot, 20);
    let frames = parse_frames(&host.receive());
    assert_eq!(frames.len(), 1);
    let (code, id, payload) = &frames[0];
    assert_eq!((*code, *id), (ResponseCode::Ok, 3));
    assert_eq!(payload, &expected);

    host.send(&frame(Opcode::Checksum, 4, &addr_len_params(0x4000, 0x400)));
    pump(&mut boot, 20);
    let frames = parse_frames(&host.receive());
    assert_eq!(
        frames,
        [(
            ResponseCode::Checksum,
            4,
            crc32::checksum(&expected).to_le_bytes().to_vec()
        )]
    );
}

#[test]
fn read_flash_of_length_zero_is_an_empty_stream() {
    let (mut boot, host) = boot_with(DummyQspi::new_default());
    host.receive();
    host.send(&frame(Opcode::ReadFlash, 5, &addr_len_params(0, 0)));
    pump(&mut boot, 20);

    let out = host.receive();
    assert_eq!(out.len(), RESPONSE_HEADER_LEN + CRC_LEN);
    let mut raw = [0u8; RESPONSE_HEADER_LEN];
    raw.copy_from_slice(&out[..RESPONSE_HEADER_LEN]);
    let hdr = ResponseHeader::decode(&raw);
    assert_eq!(hdr.response_code(), Some(ResponseCode::Ok));
    assert_eq!(hdr.payload_len, 0);
    assert_eq!(&out[RESPONSE_HEADER_LEN..], &crc32::checksum(&[]).to_le_bytes());
}

#[test]
fn write_cycle_erase_program_verify() {
    let (mut boot, host) = boot_with(DummyQspi::new_default());
    host.receive();

    let base = 0x8000u32;
    host.send(&frame(Opcode::EraseSector, 10, &base.to_le_bytes()));
    pump(&mut boot, 20);
    assert_eq!(
        parse_frames(&host.receive()),
        [(ResponseCode::Ok, 10, Vec::new())]
    );

    let mut image = vec![0u8; 2 * PAGE_SIZE];
    for (i, slot) in image.iter_mut().enumerate() {
        *slot = (i / 2) as u8;
    }
    for (page_idx, page) in image.chunks(PAGE_SIZE).enumerate() {
        let addr = base + (page_idx * PAGE_SIZE) as u32;
        let mut params = Vec::with_capacity(4 + PAGE_SIZE);
        params.extend_from_slice(&addr.to_le_bytes());
        params.extend_from_slice(page);
        host.send(&frame(Opcode::ProgramPage, 11 + page_idx as u32, &params));
        pump(&mut boot, 20);
        let frames = parse_frames(&host.receive());
        assert_eq!(frames, [(ResponseCode::Ok, 11 + page_idx as u32, Vec::new())]);
    }

    host.send(&frame(
        Opcode::Checksum,
        20,
        &addr_len_params(base, image.len() as u32),
    ));
    pump(&mut boot, 20);
    let frames = parse_frames(&host.receive());
    assert_eq!(
        frames,
        [(
            ResponseCode::Checksum,
            20,
            crc32::checksum(&image).to_le_bytes().to_vec()
        )]
    );
}

#[test]
fn stuck_erase_times_out_but_does_not_wedge_the_device() {
    let mut qspi = DummyQspi::new_default();
    qspi.jam_write_in_progress();
    let (mut boot, host) = boot_with(qspi);
    host.receive();

    host.send(&frame(Opcode::EraseSector, 30, &0u32.to_le_bytes()));
    pump(&mut boot, 20);
    assert_eq!(
        parse_frames(&host.receive()),
        [(ResponseCode::FlashTimeout, 30, Vec::new())]
    );

    host.send(&frame(Opcode::Ping, 31, &[]));
    pump(&mut boot, 20);
    assert_eq!(
        parse_frames(&host.receive()),
        [(ResponseCode::Ok, 31, Vec::new())]
    );
}

#[test]
fn baud_switch_acknowledges_at_the_old_rate() {
    let (mut boot, host) = boot_with(DummyQspi::new_default());
    host.receive();
    assert_eq!(host.baud(), 115_200);

    host.send(&frame(Opcode::SetBaudrate, 40, &230_400u32.to_le_bytes()));
    pump(&mut boot, 20);
    // The Ok frame is already in the host queue by the time the
    // divisor changes
    assert_eq!(
        parse_frames(&host.receive()),
        [(ResponseCode::Ok, 40, Vec::new())]
    );
    assert_eq!(host.baud(), 230_400);

    host.send(&frame(Opcode::Ping, 41, &[]));
    pump(&mut boot, 20);
    assert_eq!(
        parse_frames(&host.receive()),
        [(ResponseCode::Ok, 41, Vec::new())]
    );
}

#[test]
fn reset_command_ends_the_main_loop() {
    let (mut boot, host) = boot_with(DummyQspi::new_default());
    host.receive();
    host.send(&frame(Opcode::Reset, 50, &[]));
    assert_eq!(boot.run(), Shutdown::HostReset);
    assert_eq!(boot.board().resets, 1);
    assert_eq!(
        parse_frames(&host.receive()),
        [(ResponseCode::Ok, 50, Vec::new())]
    );
}
