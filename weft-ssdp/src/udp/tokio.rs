use super::{Error, Syscall};
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::AsRawFd;
use weft_netif::InterfaceIndex;

impl super::TargetedSend for tokio::net::UdpSocket {
    fn send_with<F>(
        &self,
        size: usize,
        to: &SocketAddr,
        from: &IpAddr,
        f: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        let mut buffer = vec![0u8; size];
        let actual_size = f(&mut buffer);
        self.try_io(tokio::io::Interest::WRITABLE, || {
            super::std::send_from(
                self.as_raw_fd(),
                &buffer[0..actual_size],
                to,
                from,
            )
        })
        .map_err(|e| Error::Syscall(Syscall::Sendmsg, e))
    }
}

impl super::TargetedReceive for tokio::net::UdpSocket {
    fn receive_to(
        &self,
        buffer: &mut [u8],
    ) -> Result<(usize, IpAddr, SocketAddr), Error> {
        self.try_io(tokio::io::Interest::READABLE, || {
            super::std::receive_to(self.as_raw_fd(), buffer)
        })
        .map_err(|e| Error::Syscall(Syscall::Recvmsg, e))
    }
}

impl super::Multicast for tokio::net::UdpSocket {
    fn join_multicast_group(
        &self,
        multicast_address: &IpAddr,
        interface: InterfaceIndex,
    ) -> Result<(), Error> {
        super::std::ipv4_multicast_operation(
            self.as_raw_fd(),
            libc::IP_ADD_MEMBERSHIP,
            multicast_address,
            interface,
        )
        .map_err(|e| Error::Syscall(Syscall::JoinMulticast, e))
    }

    fn leave_multicast_group(
        &self,
        multicast_address: &IpAddr,
        interface: InterfaceIndex,
    ) -> Result<(), Error> {
        super::std::ipv4_multicast_operation(
            self.as_raw_fd(),
            libc::IP_DROP_MEMBERSHIP,
            multicast_address,
            interface,
        )
        .map_err(|e| Error::Syscall(Syscall::LeaveMulticast, e))
    }
}

#[cfg(test)]
mod tests {
    use super::super::{TargetedReceive, TargetedSend};
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn tokio_sockets_round_trip_with_arrival_address() {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let tx = super::super::std::setup_socket(0).unwrap();
        let tx_port = tx.local_addr().unwrap().port();
        let rx = super::super::std::setup_socket(0).unwrap();
        let rx_port = rx.local_addr().unwrap().port();

        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(async {
                let tx = tokio::net::UdpSocket::from_std(tx).unwrap();
                let rx = tokio::net::UdpSocket::from_std(rx).unwrap();

                tx.writable().await.unwrap();
                tx.send_with(
                    512,
                    &SocketAddr::new(localhost, rx_port),
                    &localhost,
                    |b| {
                        b[0..4].copy_from_slice(b"weft");
                        4
                    },
                )
                .unwrap();

                rx.readable().await.unwrap();
                let mut buf = [0u8; 1500];
                let (n, wasto, wasfrom) = rx.receive_to(&mut buf).unwrap();
                assert_eq!(n, 4);
                assert_eq!(wasto, localhost);
                assert_eq!(wasfrom, SocketAddr::new(localhost, tx_port));
            });
    }
}
