/// The 30 status bits of the settings word, in bit order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusBit {
    SdEnabled = 0,
    UsbSerialEnabled = 1,
    EthernetEnabled = 2,
    OledEnabled = 3,
    KeyboardEnabled = 4,
    LedsEnabled = 5,
    Kline1IntEnabled = 6,
    Kline2IntEnabled = 7,
    Can1IntEnabled = 8,
    Can2IntEnabled = 9,
    KlineBridgeEnabled = 10,
    CanBridgeEnabled = 11,
    Can1Logging = 12,
    Can2Logging = 13,
    Kline1Logging = 14,
    Kline2Logging = 15,
    Can1Standard = 16,
    Can1Extended = 17,
    Can2Standard = 18,
    Can2Extended = 19,
    Can1ToCan2Bridge = 20,
    Can2ToCan1Bridge = 21,
    Kline1ToKline2Bridge = 22,
    Kline2ToKline1Bridge = 23,
    UdsCan1Enabled = 24,
    UdsCan2Enabled = 25,
    Can1UseFullframe = 26,
    Can2UseFullframe = 27,
    Can1Monitor = 28,
    Can2Monitor = 29,
}

impl StatusBit {
    pub const ALL: [StatusBit; 30] = [
        StatusBit::SdEnabled,
        StatusBit::UsbSerialEnabled,
        StatusBit::EthernetEnabled,
        StatusBit::OledEnabled,
        StatusBit::KeyboardEnabled,
        StatusBit::LedsEnabled,
        StatusBit::Kline1IntEnabled,
        StatusBit::Kline2IntEnabled,
        StatusBit::Can1IntEnabled,
        StatusBit::Can2IntEnabled,
        StatusBit::KlineBridgeEnabled,
        StatusBit::CanBridgeEnabled,
        StatusBit::Can1Logging,
        StatusBit::Can2Logging,
        StatusBit::Kline1Logging,
        StatusBit::Kline2Logging,
        StatusBit::Can1Standard,
        StatusBit::Can1Extended,
        StatusBit::Can2Standard,
        StatusBit::Can2Extended,
        StatusBit::Can1ToCan2Bridge,
        StatusBit::Can2ToCan1Bridge,
        StatusBit::Kline1ToKline2Bridge,
        StatusBit::Kline2ToKline1Bridge,
        StatusBit::UdsCan1Enabled,
        StatusBit::UdsCan2Enabled,
        StatusBit::Can1UseFullframe,
        StatusBit::Can2UseFullframe,
        StatusBit::Can1Monitor,
        StatusBit::Can2Monitor,
    ];

    /// The settings-file key for this bit
    #[must_use]
    pub fn key(&self) -> &'static str {
        match self {
            StatusBit::SdEnabled => "SD_ENABLED",
            StatusBit::UsbSerialEnabled => "USB_SERIAL_ENABLED",
            StatusBit::EthernetEnabled => "ETHERNET_ENABLED",
            StatusBit::OledEnabled => "OLED_ENABLED",
            StatusBit::KeyboardEnabled => "KEYBOARD_ENABLED",
            StatusBit::LedsEnabled => "LEDS_ENABLED",
            StatusBit::Kline1IntEnabled => "KLINE1_INT_ENABLED",
            StatusBit::Kline2IntEnabled => "KLINE2_INT_ENABLED",
            StatusBit::Can1IntEnabled => "CAN1_INT_ENABLED",
            StatusBit::Can2IntEnabled => "CAN2_INT_ENABLED",
            StatusBit::KlineBridgeEnabled => "KLINE_BRIDGE_ENABLED",
            StatusBit::CanBridgeEnabled => "CAN_BRIDGE_ENABLED",
            StatusBit::Can1Logging => "CAN1_LOGGING",
            StatusBit::Can2Logging => "CAN2_LOGGING",
            StatusBit::Kline1Logging => "KLINE1_LOGGING",
            StatusBit::Kline2Logging => "KLINE2_LOGGING",
            StatusBit::Can1Standard => "CAN1_STANDARD",
            StatusBit::Can1Extended => "CAN1_EXTENDED",
            StatusBit::Can2Standard => "CAN2_STANDARD",
            StatusBit::Can2Extended => "CAN2_EXTENDED",
            StatusBit::Can1ToCan2Bridge => "CAN1_TO_CAN2_BRIDGE",
            StatusBit::Can2ToCan1Bridge => "CAN2_TO_CAN1_BRIDGE",
            StatusBit::Kline1ToKline2Bridge => "KLINE1_TO_KLINE2_BRIDGE",
            StatusBit::Kline2ToKline1Bridge => "KLINE2_TO_KLINE1_BRIDGE",
            StatusBit::UdsCan1Enabled => "UDS_CAN1_ENABLED",
            StatusBit::UdsCan2Enabled => "UDS_CAN2_ENABLED",
            StatusBit::Can1UseFullframe => "CAN1_USE_FULLFRAME",
            StatusBit::Can2UseFullframe => "CAN2_USE_FULLFRAME",
            StatusBit::Can1Monitor => "CAN1_MONITOR",
            StatusBit::Can2Monitor => "CAN2_MONITOR",
        }
    }

    #[must_use]
    pub fn from_key(key: &str) -> Option<StatusBit> {
        StatusBit::ALL.iter().copied().find(|bit| bit.key() == key)
    }

    #[inline]
    #[must_use]
    pub fn mask(&self) -> u32 {
        1 << (*self as u8)
    }
}
