//! USB IDs of RTL2832U-based receivers.
//!
//! The list follows the one shipped with `librtlsdr`: DVB-T sticks, DAB
//! sticks, and a couple of PCIe cards that all carry the same demodulator.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KnownDevice {
    pub vendor_id: u16,
    pub product_id: u16,
    pub name: &'static str,
}

const fn dev(vendor_id: u16, product_id: u16, name: &'static str) -> KnownDevice {
    KnownDevice {
        vendor_id,
        product_id,
        name,
    }
}

pub static KNOWN_DEVICES: &[KnownDevice] = &[
    dev(0x0bda, 0x2832, "Generic RTL2832U"),
    dev(0x0bda, 0x2838, "Generic RTL2832U OEM"),
    dev(0x0413, 0x6680, "DigitalNow Quad DVB-T PCI-E card"),
    dev(0x0413, 0x6f0f, "Leadtek WinFast DTV Dongle mini D"),
    dev(0x0458, 0x707f, "Genius TVGo DVB-T03 USB dongle (Ver. B)"),
    dev(0x0ccd, 0x00a9, "Terratec Cinergy T Stick Black (rev 1)"),
    dev(0x0ccd, 0x00b3, "Terratec NOXON DAB/DAB+ USB dongle (rev 1)"),
    dev(0x0ccd, 0x00b4, "Terratec Deutschlandradio DAB Stick"),
    dev(0x0ccd, 0x00b5, "Terratec NOXON DAB Stick - Radio Energy"),
    dev(0x0ccd, 0x00b7, "Terratec Media Broadcast DAB Stick"),
    dev(0x0ccd, 0x00b8, "Terratec BR DAB Stick"),
    dev(0x0ccd, 0x00b9, "Terratec WDR DAB Stick"),
    dev(0x0ccd, 0x00c0, "Terratec MuellerVerlag DAB Stick"),
    dev(0x0ccd, 0x00c6, "Terratec Fraunhofer DAB Stick"),
    dev(0x0ccd, 0x00d3, "Terratec Cinergy T Stick RC (Rev.3)"),
    dev(0x0ccd, 0x00d7, "Terratec T Stick PLUS"),
    dev(0x0ccd, 0x00e0, "Terratec NOXON DAB/DAB+ USB dongle (rev 2)"),
    dev(0x1554, 0x5020, "PixelView PV-DT235U(RN)"),
    dev(0x15f4, 0x0131, "Astrometa DVB-T/DVB-T2"),
    dev(0x15f4, 0x0133, "HanfTek DAB+FM+DVB-T"),
    dev(0x185b, 0x0620, "Compro Videomate U620F"),
    dev(0x185b, 0x0650, "Compro Videomate U650F"),
    dev(0x185b, 0x0680, "Compro Videomate U680F"),
    dev(0x1b80, 0xd393, "GIGABYTE GT-U7300"),
    dev(0x1b80, 0xd394, "DIKOM USB-DVBT HD"),
    dev(0x1b80, 0xd395, "Peak 102569AGPK"),
    dev(0x1b80, 0xd397, "KWorld KW-UB450-T USB DVB-T Pico TV"),
    dev(0x1b80, 0xd398, "Zaapa ZT-MINDVBZP"),
    dev(0x1b80, 0xd39d, "SVEON STV20 DVB-T USB & FM"),
    dev(0x1b80, 0xd3a4, "Twintech UT-40"),
    dev(0x1b80, 0xd3a8, "ASUS U3100MINI_PLUS_V2"),
    dev(0x1b80, 0xd3af, "SVEON STV27 DVB-T USB & FM"),
    dev(0x1b80, 0xd3b0, "SVEON STV21 DVB-T USB & FM"),
    dev(0x1d19, 0x1101, "Dexatek DK DVB-T Dongle (Logilink VG0002A)"),
    dev(0x1d19, 0x1102, "Dexatek DK DVB-T Dongle (MSI DigiVox mini II V3.0)"),
    dev(0x1d19, 0x1103, "Dexatek Technology Ltd. DK 5217 DVB-T Dongle"),
    dev(0x1d19, 0x1104, "MSI DigiVox Micro HD"),
    dev(0x1f4d, 0xa803, "Sweex DVB-T USB"),
    dev(0x1f4d, 0xb803, "GTek T803"),
    dev(0x1f4d, 0xc803, "Lifeview LV5TDeluxe"),
    dev(0x1f4d, 0xd286, "MyGica TD312"),
    dev(0x1f4d, 0xd803, "PROlectrix DV107669"),
];

pub fn lookup(vendor_id: u16, product_id: u16) -> Option<&'static KnownDevice> {
    KNOWN_DEVICES
        .iter()
        .find(|d| d.vendor_id == vendor_id && d.product_id == product_id)
}

pub fn is_known_device(vendor_id: u16, product_id: u16) -> bool {
    lookup(vendor_id, product_id).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_ids_known() {
        assert!(is_known_device(0x0bda, 0x2832));
        assert!(is_known_device(0x0bda, 0x2838));
        assert_eq!(lookup(0x0bda, 0x2838).unwrap().name, "Generic RTL2832U OEM");
    }

    #[test]
    fn vendor_alone_is_not_enough() {
        assert!(!is_known_device(0x0bda, 0x8153)); // Realtek ethernet
        assert!(!is_known_device(0x1d50, 0x6089)); // HackRF
        assert!(!is_known_device(0, 0));
    }

    #[test]
    fn table_has_no_duplicates() {
        for (i, a) in KNOWN_DEVICES.iter().enumerate() {
            for b in &KNOWN_DEVICES[i + 1..] {
                assert!(
                    (a.vendor_id, a.product_id) != (b.vendor_id, b.product_id),
                    "duplicate {:04x}:{:04x}",
                    a.vendor_id,
                    a.product_id
                );
            }
        }
    }

    #[test]
    fn names_non_empty() {
        assert!(KNOWN_DEVICES.iter().all(|d| !d.name.is_empty()));
    }
}
