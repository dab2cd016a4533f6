use super::Reply;

/// A single value with a generation bumped by every successful write
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefState {
    value: Option<Vec<u8>>,
    generation: u64,
}

impl RefState {
    pub fn get(&self) -> Reply {
        Reply::Value {
            value: self.value.clone(),
            generation: self.generation,
        }
    }

    pub fn set(&mut self, value: Option<Vec<u8>>) -> Reply {
        self.value = value;
        self.generation += 1;
        Reply::Written {
            generation: self.generation,
        }
    }

    /// Replaces the value only if nothing was written since `expected_generation`
    pub fn compare_and_set(&mut self, expected_generation: u64, value: Option<Vec<u8>>) -> Reply {
        if expected_generation != self.generation {
            return Reply::Swapped {
                swapped: false,
                generation: self.generation,
            };
        }
        self.value = value;
        self.generation += 1;
        Reply::Swapped {
            swapped: true,
            generation: self.generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn starts_empty() {
        assert_eq!(
            RefState::default().get(),
            Reply::Value {
                value: None,
                generation: 0
            }
        );
    }

    #[test]
    fn every_write_bumps_generation() {
        let mut r = RefState::default();
        assert_eq!(r.set(Some(b"a".to_vec())), Reply::Written { generation: 1 });
        assert_eq!(r.set(None), Reply::Written { generation: 2 });
        assert_eq!(
            r.get(),
            Reply::Value {
                value: None,
                generation: 2
            }
        );
    }

    #[test]
    fn only_one_cas_per_generation_wins() {
        let mut r = RefState::default();
        let results: Vec<Reply> = (0..4u8)
            .map(|i| r.compare_and_set(0, Some(vec![i])))
            .collect();
        assert_eq!(
            results[0],
            Reply::Swapped {
                swapped: true,
                generation: 1
            }
        );
        for lost in &results[1..] {
            assert_eq!(
                lost,
                &Reply::Swapped {
                    swapped: false,
                    generation: 1
                }
            );
        }
        assert_eq!(
            r.get(),
            Reply::Value {
                value: Some(vec![0]),
                generation: 1
            }
        );
    }
}
