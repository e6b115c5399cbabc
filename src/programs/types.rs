//! Program and attach type tags, and section-name inference.

/// Kernel program type, by ABI value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum ProgType {
    #[default]
    Unspec = 0,
    SocketFilter = 1,
    Kprobe = 2,
    SchedCls = 3,
    SchedAct = 4,
    Tracepoint = 5,
    Xdp = 6,
    PerfEvent = 7,
    CgroupSkb = 8,
    CgroupSock = 9,
    LwtIn = 10,
    LwtOut = 11,
    LwtXmit = 12,
    SockOps = 13,
    SkSkb = 14,
    CgroupDevice = 15,
    SkMsg = 16,
    RawTracepoint = 17,
    CgroupSockAddr = 18,
    LwtSeg6local = 19,
    LircMode2 = 20,
}

/// Kernel expected-attach type, by ABI value.
///
/// Zero doubles as "unset" in the ABI; the kernel only consults this
/// field for program types with multiple attach points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum AttachType {
    #[default]
    CgroupInetIngress = 0,
    CgroupInetEgress = 1,
    CgroupInetSockCreate = 2,
    CgroupSockOps = 3,
    SkSkbStreamParser = 4,
    SkSkbStreamVerdict = 5,
    CgroupDevice = 6,
    SkMsgVerdict = 7,
    CgroupInet4Bind = 8,
    CgroupInet6Bind = 9,
    CgroupInet4Connect = 10,
    CgroupInet6Connect = 11,
    CgroupInet4PostBind = 12,
    CgroupInet6PostBind = 13,
    CgroupUdp4Sendmsg = 14,
    CgroupUdp6Sendmsg = 15,
    LircMode2 = 16,
}

struct SectionDef {
    prefix: &'static str,
    prog_type: ProgType,
    attach_type: AttachType,
}

const fn sec(prefix: &'static str, prog_type: ProgType) -> SectionDef {
    SectionDef {
        prefix,
        prog_type,
        attach_type: AttachType::CgroupInetIngress,
    }
}

const fn sec_attach(
    prefix: &'static str,
    prog_type: ProgType,
    attach_type: AttachType,
) -> SectionDef {
    SectionDef {
        prefix,
        prog_type,
        attach_type,
    }
}

/// Section-name prefixes in match order; more specific prefixes come
/// before their generic counterparts.
const SECTION_DEFS: &[SectionDef] = &[
    sec("socket", ProgType::SocketFilter),
    sec("kprobe/", ProgType::Kprobe),
    sec("kretprobe/", ProgType::Kprobe),
    sec("classifier", ProgType::SchedCls),
    sec("action", ProgType::SchedAct),
    sec("tracepoint/", ProgType::Tracepoint),
    sec("raw_tracepoint/", ProgType::RawTracepoint),
    sec("xdp", ProgType::Xdp),
    sec("perf_event", ProgType::PerfEvent),
    sec("lwt_in", ProgType::LwtIn),
    sec("lwt_out", ProgType::LwtOut),
    sec("lwt_xmit", ProgType::LwtXmit),
    sec("lwt_seg6local", ProgType::LwtSeg6local),
    sec_attach(
        "cgroup_skb/ingress",
        ProgType::CgroupSkb,
        AttachType::CgroupInetIngress,
    ),
    sec_attach(
        "cgroup_skb/egress",
        ProgType::CgroupSkb,
        AttachType::CgroupInetEgress,
    ),
    sec("cgroup/skb", ProgType::CgroupSkb),
    sec_attach(
        "cgroup/sock",
        ProgType::CgroupSock,
        AttachType::CgroupInetSockCreate,
    ),
    sec_attach(
        "cgroup/post_bind4",
        ProgType::CgroupSock,
        AttachType::CgroupInet4PostBind,
    ),
    sec_attach(
        "cgroup/post_bind6",
        ProgType::CgroupSock,
        AttachType::CgroupInet6PostBind,
    ),
    sec_attach("cgroup/dev", ProgType::CgroupDevice, AttachType::CgroupDevice),
    sec_attach("sockops", ProgType::SockOps, AttachType::CgroupSockOps),
    sec_attach(
        "sk_skb/stream_parser",
        ProgType::SkSkb,
        AttachType::SkSkbStreamParser,
    ),
    sec_attach(
        "sk_skb/stream_verdict",
        ProgType::SkSkb,
        AttachType::SkSkbStreamVerdict,
    ),
    sec("sk_skb", ProgType::SkSkb),
    sec_attach("sk_msg", ProgType::SkMsg, AttachType::SkMsgVerdict),
    sec_attach("lirc_mode2", ProgType::LircMode2, AttachType::LircMode2),
    sec_attach(
        "cgroup/bind4",
        ProgType::CgroupSockAddr,
        AttachType::CgroupInet4Bind,
    ),
    sec_attach(
        "cgroup/bind6",
        ProgType::CgroupSockAddr,
        AttachType::CgroupInet6Bind,
    ),
    sec_attach(
        "cgroup/connect4",
        ProgType::CgroupSockAddr,
        AttachType::CgroupInet4Connect,
    ),
    sec_attach(
        "cgroup/connect6",
        ProgType::CgroupSockAddr,
        AttachType::CgroupInet6Connect,
    ),
    sec_attach(
        "cgroup/sendmsg4",
        ProgType::CgroupSockAddr,
        AttachType::CgroupUdp4Sendmsg,
    ),
    sec_attach(
        "cgroup/sendmsg6",
        ProgType::CgroupSockAddr,
        AttachType::CgroupUdp6Sendmsg,
    ),
];

/// Infer program and attach types from a section name.
pub fn infer_from_section(name: &str) -> Option<(ProgType, AttachType)> {
    SECTION_DEFS
        .iter()
        .find(|def| name.starts_with(def.prefix))
        .map(|def| (def.prog_type, def.attach_type))
}

/// Whether a program type requires the object to carry a kernel version.
pub fn needs_kern_version(prog_type: ProgType) -> bool {
    matches!(
        prog_type,
        ProgType::Unspec
            | ProgType::Kprobe
            | ProgType::Tracepoint
            | ProgType::RawTracepoint
            | ProgType::PerfEvent
    )
}
