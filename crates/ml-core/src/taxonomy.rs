use std::fmt;

/// Vehicle classes retained from the detector output, keyed by COCO class id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VehicleClass {
    Car,
    Motorcycle,
    Bus,
    Truck,
}

impl VehicleClass {
    pub const ALL: [VehicleClass; 4] = [
        VehicleClass::Car,
        VehicleClass::Motorcycle,
        VehicleClass::Bus,
        VehicleClass::Truck,
    ];

    pub fn from_class_id(class_id: u32) -> Option<Self> {
        match class_id {
            2 => Some(VehicleClass::Car),
            3 => Some(VehicleClass::Motorcycle),
            5 => Some(VehicleClass::Bus),
            7 => Some(VehicleClass::Truck),
            _ => None,
        }
    }

    pub fn class_id(self) -> u32 {
        match self {
            VehicleClass::Car => 2,
            VehicleClass::Motorcycle => 3,
            VehicleClass::Bus => 5,
            VehicleClass::Truck => 7,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            VehicleClass::Car => "car",
            VehicleClass::Motorcycle => "motorcycle",
            VehicleClass::Bus => "bus",
            VehicleClass::Truck => "truck",
        }
    }

    /// Class ids handed to the classifier as its class filter.
    pub fn class_filter() -> Vec<u32> {
        Self::ALL.iter().map(|class| class.class_id()).collect()
    }
}

impl fmt::Display for VehicleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_ids_round_trip_through_the_whitelist() {
        for class in VehicleClass::ALL {
            assert_eq!(VehicleClass::from_class_id(class.class_id()), Some(class));
        }
        // person, bicycle, traffic light
        assert_eq!(VehicleClass::from_class_id(0), None);
        assert_eq!(VehicleClass::from_class_id(1), None);
        assert_eq!(VehicleClass::from_class_id(9), None);
        assert_eq!(VehicleClass::class_filter(), vec![2, 3, 5, 7]);
    }
}
