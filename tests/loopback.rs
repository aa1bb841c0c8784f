use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    thread,
    time::Duration,
};

use anyhow::Context;
use labcomm::{
    config::PollConfig,
    protocol::usbtmc::{msg_id, padded_len, Header, HEADER_LEN},
    CommonCommands, ModbusTcp, Session, UsbTmc,
};

fn connect(device: impl FnOnce(TcpStream) + Send + 'static) -> anyhow::Result<TcpStream> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    thread::spawn(move || {
        if let Ok((stream, _)) = listener.accept() {
            device(stream);
        }
    });
    Ok(TcpStream::connect(addr)?)
}

/// A USBTMC device that answers `*IDN?` and reports operation complete on the
/// second `*OPC?`.
fn usbtmc_device(mut stream: TcpStream) {
    let mut last = String::new();
    let mut opc_polls = 0;
    loop {
        let mut header = [0u8; HEADER_LEN];
        if stream.read_exact(&mut header).is_err() {
            return;
        }
        let Ok(header) = Header::decode(&header) else {
            return;
        };
        match header.msg_id {
            msg_id::DEV_DEP_MSG_OUT => {
                let size = header.transfer_size as usize;
                let mut payload = vec![0u8; padded_len(HEADER_LEN + size) - HEADER_LEN];
                if stream.read_exact(&mut payload).is_err() {
                    return;
                }
                last = String::from_utf8_lossy(&payload[..size]).into_owned();
            }
            msg_id::REQUEST_DEV_DEP_MSG_IN => {
                let reply = match last.as_str() {
                    "*IDN?\n" => "ACME,MODEL 42,SN0001,1.0.0\n".to_string(),
                    "*OPC?\n" => {
                        opc_polls += 1;
                        format!("{}\n", u8::from(opc_polls >= 2))
                    }
                    _ => String::new(),
                };
                last.clear();
                let response = Header {
                    msg_id: msg_id::DEV_DEP_MSG_IN,
                    tag: header.tag,
                    transfer_size: u32::try_from(reply.len()).expect("short reply"),
                    attributes: 0x01,
                    term_char: 0,
                }
                .frame(reply.as_bytes());
                if stream.write_all(&response).is_err() {
                    return;
                }
            }
            _ => return,
        }
    }
}

#[test]
fn common_commands_over_usbtmc_over_tcp() -> anyhow::Result<()> {
    let stream = connect(usbtmc_device)?;
    let mut commands = CommonCommands::with_config(
        Session::new(UsbTmc::new(stream)),
        PollConfig {
            interval_ms: 1,
            timeout_ms: 1000,
            max_polls: Some(10),
        },
    );

    let identity = commands.identify().context("identify")?;
    assert_eq!(identity.manufacturer, "ACME");
    assert_eq!(identity.model, "42");

    let polls = commands
        .wait_for_operation_complete(Duration::from_millis(1))
        .context("wait for operation complete")?;
    assert_eq!(polls, 2);

    let tmc = commands.into_inner().into_inner();
    assert_eq!(tmc.tag(), 4);
    Ok(())
}

/// A Modbus server with four holding registers.
fn modbus_device(mut stream: TcpStream) {
    let mut registers = [0u16; 4];
    loop {
        let mut mbap = [0u8; 7];
        if stream.read_exact(&mut mbap).is_err() {
            return;
        }
        let length = usize::from(u16::from_be_bytes([mbap[4], mbap[5]]));
        let mut pdu = vec![0u8; length - 1];
        if stream.read_exact(&mut pdu).is_err() {
            return;
        }
        let address = usize::from(u16::from_be_bytes([pdu[1], pdu[2]]));
        let value = u16::from_be_bytes([pdu[3], pdu[4]]);

        let response_pdu = match pdu[0] {
            0x03 if address + usize::from(value) <= registers.len() => {
                let mut body = vec![0x03, u8::try_from(value * 2).expect("small")];
                for r in &registers[address..address + usize::from(value)] {
                    body.extend_from_slice(&r.to_be_bytes());
                }
                body
            }
            0x06 if address < registers.len() => {
                registers[address] = value;
                pdu.clone()
            }
            function => vec![function | 0x80, 0x02],
        };

        let mut frame = Vec::new();
        frame.extend_from_slice(&mbap[..4]);
        frame.extend_from_slice(&u16::try_from(response_pdu.len() + 1).expect("small").to_be_bytes());
        frame.push(mbap[6]);
        frame.extend_from_slice(&response_pdu);
        if stream.write_all(&frame).is_err() {
            return;
        }
    }
}

#[test]
fn modbus_over_tcp() -> anyhow::Result<()> {
    let stream = connect(modbus_device)?;
    let mut modbus = ModbusTcp::new(stream);

    modbus.write_single_register(1, 2, 0xBEEF)?;
    assert_eq!(modbus.read_holding_registers(1, 1, 3)?, vec![0, 0xBEEF, 0]);

    let err = modbus
        .read_holding_registers(1, 3, 2)
        .expect_err("out of range read should fail");
    assert!(matches!(
        err,
        labcomm::InstrumentError::DeviceError { code: 0x02, .. }
    ));
    assert_eq!(modbus.transaction_id(), 3);
    Ok(())
}
