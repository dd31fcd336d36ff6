//! Virtual addresses, the loopback pair, and negotiation roles.
//!
//! Hub addresses are a monotonic counter rendered as four dot-separated
//! octets. They look like IPv4 but carry no routing meaning and are reassigned
//! whenever a node reconnects to the hub.

/// Name consumers use for self-traffic.
pub const LOCALHOST: &str = "localhost";

/// Loopback record that plays the receiving side of self-traffic.
pub const LOOPBACK_SENDER: &str = "local:0";

/// Loopback record that outbound self-connections are opened on.
pub const LOOPBACK_RECEIVER: &str = "local:1";

/// Render an allocation counter as `a.b.c.d`.
///
/// Counters past `u32::MAX` keep only their low 32 bits.
pub fn render_address(counter: u64) -> String {
    let mut n = counter;
    let mut octets = [0u8; 4];
    for slot in octets.iter_mut().rev() {
        *slot = (n % 256) as u8;
        n /= 256;
    }
    format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3])
}

/// True for strings shaped like a rendered hub address.
pub fn is_hub_address(s: &str) -> bool {
    let mut count = 0;
    for part in s.split('.') {
        count += 1;
        if part.is_empty() || part.len() > 3 || part.parse::<u8>().is_err() {
            return false;
        }
    }
    count == 4
}

pub fn is_loopback(address: &str) -> bool {
    address == LOOPBACK_SENDER || address == LOOPBACK_RECEIVER
}

/// The other half of the loopback pair.
pub fn loopback_complement(address: &str) -> Option<&'static str> {
    match address {
        LOOPBACK_SENDER => Some(LOOPBACK_RECEIVER),
        LOOPBACK_RECEIVER => Some(LOOPBACK_SENDER),
        _ => None,
    }
}

/// Address as shown to consumers: loopback identifiers become `localhost`.
pub fn display_address(address: &str) -> &str {
    if is_loopback(address) {
        LOCALHOST
    } else {
        address
    }
}

/// Role of the local side for the ordered pair `(local, remote)`.
///
/// The lexicographically smaller address is polite. Both sides compute the
/// same answer from opposite ends, so no extra signaling is needed.
pub fn is_polite(local: &str, remote: &str) -> bool {
    local < remote
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_counter_as_octets() {
        assert_eq!(render_address(0), "0.0.0.0");
        assert_eq!(render_address(1), "0.0.0.1");
        assert_eq!(render_address(255), "0.0.0.255");
        assert_eq!(render_address(256), "0.0.1.0");
        assert_eq!(render_address(65_537), "0.1.0.1");
        assert_eq!(render_address(u64::from(u32::MAX)), "255.255.255.255");
    }

    #[test]
    fn hub_address_shape() {
        assert!(is_hub_address("0.0.0.1"));
        assert!(is_hub_address("10.200.3.255"));
        assert!(!is_hub_address("0.0.1"));
        assert!(!is_hub_address("0.0.0.256"));
        assert!(!is_hub_address("printer.local"));
        assert!(!is_hub_address(LOCALHOST));
        assert!(!is_hub_address("0..0.1"));
    }

    #[test]
    fn loopback_pair_is_complementary() {
        assert_eq!(loopback_complement(LOOPBACK_SENDER), Some(LOOPBACK_RECEIVER));
        assert_eq!(loopback_complement(LOOPBACK_RECEIVER), Some(LOOPBACK_SENDER));
        assert_eq!(loopback_complement("0.0.0.1"), None);
        assert_eq!(display_address(LOOPBACK_SENDER), LOCALHOST);
        assert_eq!(display_address("0.0.0.7"), "0.0.0.7");
    }

    #[test]
    fn exactly_one_side_is_polite() {
        assert!(is_polite("0.0.0.1", "0.0.0.2"));
        assert!(!is_polite("0.0.0.2", "0.0.0.1"));
        assert!(is_polite(LOOPBACK_SENDER, LOOPBACK_RECEIVER));
        assert!(!is_polite(LOOPBACK_RECEIVER, LOOPBACK_SENDER));
    }
}
