pub use self::udp::UdpClient;

mod udp;
