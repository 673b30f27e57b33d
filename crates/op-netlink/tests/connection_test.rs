//! Integration tests for the netlink connection against a scripted transport

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use op_netlink::family::{CTRL_ATTR_FAMILY_NAME, CTRL_CMD_GETFAMILY, GENL_ID_CTRL};
    use op_netlink::message::{NLMSG_DONE, NLM_F_ACK, NLM_F_DUMP, NLM_F_MULTIPART, NLM_F_REQUEST};
    use op_netlink::prelude::*;
    use op_netlink::{ConnectionConfig, MemoryTransport, NetlinkHeader, OutgoingMessage};

    /// CTRL_CMD_NEWFAMILY reply for "ovs_datapath" as captured from a kernel
    /// (little-endian host, pid 0x2789, sequence 1).
    const OVS_DATAPATH_FAMILY_REPLY: [u8; 192] = [
        0xC0, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
        0x89, 0x27, 0x00, 0x00, 0x01, 0x02, 0x00, 0x00, 0x11, 0x00, 0x02, 0x00,
        0x6F, 0x76, 0x73, 0x5F, 0x64, 0x61, 0x74, 0x61, 0x70, 0x61, 0x74, 0x68,
        0x00, 0x00, 0x00, 0x00, 0x06, 0x00, 0x01, 0x00, 0x18, 0x00, 0x00, 0x00,
        0x08, 0x00, 0x03, 0x00, 0x01, 0x00, 0x00, 0x00, 0x08, 0x00, 0x04, 0x00,
        0x04, 0x00, 0x00, 0x00, 0x08, 0x00, 0x05, 0x00, 0x03, 0x00, 0x00, 0x00,
        0x54, 0x00, 0x06, 0x00, 0x14, 0x00, 0x01, 0x00, 0x08, 0x00, 0x01, 0x00,
        0x01, 0x00, 0x00, 0x00, 0x08, 0x00, 0x02, 0x00, 0x0B, 0x00, 0x00, 0x00,
        0x14, 0x00, 0x02, 0x00, 0x08, 0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00,
        0x08, 0x00, 0x02, 0x00, 0x0B, 0x00, 0x00, 0x00, 0x14, 0x00, 0x03, 0x00,
        0x08, 0x00, 0x01, 0x00, 0x03, 0x00, 0x00, 0x00, 0x08, 0x00, 0x02, 0x00,
        0x0E, 0x00, 0x00, 0x00, 0x14, 0x00, 0x04, 0x00, 0x08, 0x00, 0x01, 0x00,
        0x04, 0x00, 0x00, 0x00, 0x08, 0x00, 0x02, 0x00, 0x0B, 0x00, 0x00, 0x00,
        0x24, 0x00, 0x07, 0x00, 0x20, 0x00, 0x01, 0x00, 0x08, 0x00, 0x02, 0x00,
        0x03, 0x00, 0x00, 0x00, 0x11, 0x00, 0x01, 0x00, 0x6F, 0x76, 0x73, 0x5F,
        0x64, 0x61, 0x74, 0x61, 0x70, 0x61, 0x74, 0x68, 0x00, 0x00, 0x00, 0x00,
    ];

    fn fixture_config() -> ConnectionConfig {
        ConnectionConfig {
            max_batch_size: 1,
            bypass_send_queue: true,
            ..Default::default()
        }
    }

    fn ready_connection(
        config: &ConnectionConfig,
    ) -> (NetlinkConnection<MemoryTransport>, MemoryTransport) {
        let observer = MemoryTransport::new(0x2789);
        let mut conn = NetlinkConnection::new(observer.clone(), config);
        conn.handle().initialize(&[], |_| {}).unwrap();
        conn.handle_write_event().unwrap();
        (conn, observer)
    }

    fn dump_request() -> OutgoingMessage {
        MessageBuilder::genl(24, NLM_F_REQUEST | NLM_F_DUMP, 3, 1)
            .build()
            .unwrap()
    }

    fn data_reply(sequence: u32, flags: u16, marker: u32) -> Vec<u8> {
        let mut b = MessageBuilder::genl(24, flags, 1, 1);
        b.put_u32(0, Endian::Host);
        b.attr_u32(1, marker, Endian::Host).unwrap();
        let mut m = b.build().unwrap();
        m.set_sequence(sequence);
        m.into_bytes()
    }

    fn done(sequence: u32) -> Vec<u8> {
        let mut b = MessageBuilder::new(NLMSG_DONE, NLM_F_MULTIPART);
        b.put_i32(0, Endian::Host);
        let mut m = b.build().unwrap();
        m.set_sequence(sequence);
        m.into_bytes()
    }

    #[cfg(target_endian = "little")]
    #[test]
    fn test_resolve_family_from_kernel_reply() {
        let observer = MemoryTransport::new(0x2789);
        let mut conn = NetlinkConnection::new(observer.clone(), &fixture_config());
        let handle = conn.handle();

        let (callback, mut reply) = PendingReply::pair();
        let sequence = handle.resolve_family("ovs_datapath", callback).unwrap();
        assert_eq!(sequence, 1);

        conn.handle_write_event().unwrap();
        let writes = observer.writes();
        assert_eq!(writes.len(), 1);
        let header = NetlinkHeader::parse(&writes[0]).unwrap();
        assert_eq!(header.message_type, GENL_ID_CTRL);
        assert_eq!(header.sequence, 1);
        assert_eq!(header.pid, 0x2789);
        assert_eq!(writes[0][16], CTRL_CMD_GETFAMILY);

        let request = NetlinkMessage::parse(&writes[0]).unwrap();
        let name = request
            .attrs(0)
            .unwrap()
            .find(CTRL_ATTR_FAMILY_NAME)
            .unwrap()
            .unwrap();
        assert_eq!(name.get_str().unwrap(), "ovs_datapath");

        observer.push_inbound(OVS_DATAPATH_FAMILY_REPLY.to_vec());
        assert_eq!(conn.handle_read_event().unwrap(), 1);

        let family = reply.try_take().expect("reply delivered").unwrap();
        assert_eq!(family.id, 24);
        assert_eq!(family.name, "ovs_datapath");
        assert_eq!(family.version, 1);
        assert_eq!(family.header_size, 4);
        assert_eq!(family.max_attr, 3);
        assert_eq!(family.command_flags(3), Some(0x0E));
        assert_eq!(family.commands.len(), 4);
        assert_eq!(family.multicast_group("ovs_datapath"), Some(3));

        assert_eq!(handle.family("ovs_datapath").unwrap().id, 24);
        assert_eq!(handle.pending_requests(), 0);
    }

    #[test]
    fn test_batch_size_one_writes_each_request() {
        let config = ConnectionConfig {
            max_batch_size: 1,
            ..Default::default()
        };
        let (mut conn, observer) = ready_connection(&config);
        let handle = conn.handle();

        for _ in 0..4 {
            handle
                .submit(dump_request(), Expect::Dump, Box::new(|_| {}))
                .unwrap();
        }
        conn.handle_write_event().unwrap();
        assert_eq!(observer.write_count(), 4);
    }

    #[test]
    fn test_full_batch_is_one_write_in_submission_order() {
        let config = ConnectionConfig {
            max_batch_size: 4,
            ..Default::default()
        };
        let (mut conn, observer) = ready_connection(&config);
        let handle = conn.handle();

        let mut expected = Vec::new();
        for _ in 0..4 {
            let seq = handle
                .submit(dump_request(), Expect::Dump, Box::new(|_| {}))
                .unwrap();
            expected.push(seq);
        }
        conn.handle_write_event().unwrap();

        let writes = observer.writes();
        assert_eq!(writes.len(), 1);
        let sequences: Vec<u32> = op_netlink::message::messages(&writes[0])
            .map(|m| m.unwrap().sequence())
            .collect();
        assert_eq!(sequences, expected);
    }

    #[test]
    fn test_dump_completes_on_done() {
        let (mut conn, observer) = ready_connection(&ConnectionConfig::default());
        let handle = conn.handle();

        let mut reply = handle
            .request(dump_request(), Expect::Dump)
            .unwrap();
        conn.handle_write_event().unwrap();
        let seq = NetlinkHeader::parse(&observer.writes()[0]).unwrap().sequence;

        let mut datagram = data_reply(seq, NLM_F_MULTIPART, 7);
        datagram.extend(data_reply(seq, NLM_F_MULTIPART, 8));
        observer.push_inbound(datagram);
        conn.handle_read_event().unwrap();
        assert!(reply.try_take().is_none());

        observer.push_inbound(done(seq));
        conn.handle_read_event().unwrap();
        let replies = reply.try_take().unwrap().unwrap();
        assert_eq!(replies.len(), 2);
    }

    #[test]
    fn test_error_reply_reaches_only_its_request() {
        let (mut conn, observer) = ready_connection(&ConnectionConfig::default());
        let handle = conn.handle();

        let mut first = handle
            .request(
                MessageBuilder::genl(24, NLM_F_REQUEST | NLM_F_ACK, 2, 1)
                    .build()
                    .unwrap(),
                Expect::Ack,
            )
            .unwrap();
        let mut second = handle
            .request(dump_request(), Expect::Dump)
            .unwrap();
        conn.handle_write_event().unwrap();

        let mut b = MessageBuilder::new(op_netlink::message::NLMSG_ERROR, 0);
        b.put_i32(-libc::ENODEV, Endian::Host);
        b.put_zeros(16);
        let mut m = b.build().unwrap();
        m.set_sequence(1);
        observer.push_inbound(m.into_bytes());
        conn.handle_read_event().unwrap();

        match first.try_take() {
            Some(Err(NetlinkError::Protocol { code })) => assert_eq!(code, -libc::ENODEV),
            other => panic!("unexpected reply: {:?}", other.map(|r| r.is_ok())),
        }
        assert!(second.try_take().is_none());
        assert_eq!(handle.pending_requests(), 1);
    }

    #[test]
    fn test_close_fails_every_pending_request_once() {
        let (mut conn, _observer) = ready_connection(&ConnectionConfig::default());
        let handle = conn.handle();

        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let calls = calls.clone();
            handle
                .submit(
                    dump_request(),
                    Expect::Dump,
                    Box::new(move |r| {
                        assert!(matches!(r, Err(NetlinkError::ConnectionClosed)));
                        calls.fetch_add(1, Ordering::SeqCst);
                    }),
                )
                .unwrap();
        }
        conn.close();
        conn.close();
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(handle.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_request_times_out() {
        let config = ConnectionConfig {
            request_timeout_ms: 10,
            ..Default::default()
        };
        let (conn, _observer) = ready_connection(&config);
        let handle = conn.handle();

        let mut reply = handle
            .request(dump_request(), Expect::Dump)
            .unwrap();
        assert_eq!(conn.expire_requests(Instant::now()), 0);
        assert_eq!(
            conn.expire_requests(Instant::now() + Duration::from_millis(50)),
            1
        );
        assert!(matches!(
            reply.try_take(),
            Some(Err(NetlinkError::Timeout { .. }))
        ));
    }

    #[test]
    fn test_submissions_from_many_threads_get_unique_sequences() {
        let (mut conn, observer) = ready_connection(&ConnectionConfig {
            max_batch_size: 8,
            ..Default::default()
        });
        let handle = conn.handle();

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let handle = handle.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| {
                            handle
                                .submit(dump_request(), Expect::Dump, Box::new(|_| {}))
                                .unwrap()
                        })
                        .collect::<Vec<u32>>()
                })
            })
            .collect();
        let mut all: Vec<u32> = threads
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 200);

        conn.handle_write_event().unwrap();
        let written: usize = observer
            .writes()
            .iter()
            .map(|w| op_netlink::message::messages(w).count())
            .sum();
        assert_eq!(written, 200);
    }
}
