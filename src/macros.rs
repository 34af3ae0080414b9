/// Declares the table of QUIC frame type codes (§4.2) as associated `u64`
/// constants on a unit marker type, rather than as enum discriminants: the
/// STREAM/MAX_STREAMS/STREAMS_BLOCKED codes are base values ORed with mode
/// bits on the wire, so callers need the raw integers, not a closed enum.
#[macro_export]
macro_rules! frame {
    {$($typename:ident = $encoding:expr,)*} => {
        #[allow(non_camel_case_types)]
        pub struct FrameType;

        impl FrameType {
            $(pub const $typename: u64 = $encoding;)*
        }
    }
}
