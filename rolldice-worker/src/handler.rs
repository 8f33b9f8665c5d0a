use common_kafka::{DecodeError, InboundMessage, MessageHandler};
use common_types::DiceRoll;
use tracing::info;

pub const DICE_ROLLS_CONSUMED: &str = "dice_rolls_consumed_total";

/// Decodes published dice rolls and logs them.
pub struct DiceRollHandler;

impl DiceRollHandler {
    pub fn decode(message: &InboundMessage) -> Result<DiceRoll, DecodeError> {
        if message.value.is_empty() {
            return Err(DecodeError::EmptyPayload);
        }
        serde_json::from_slice(&message.value).map_err(DecodeError::malformed)
    }
}

impl MessageHandler for DiceRollHandler {
    fn handle(&self, message: &InboundMessage) -> Result<(), DecodeError> {
        let roll = Self::decode(message)?;
        metrics::counter!(DICE_ROLLS_CONSUMED, "sides" => roll.sides.to_string()).increment(1);
        info!(
            rolls = roll.rolls,
            sides = roll.sides,
            distribution = ?roll.distribution,
            "dice roll"
        );
        Ok(())
    }
}
