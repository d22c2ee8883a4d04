/// Dirección del destinatario en el canal externo (chat_id de Telegram).
pub type RecipientId = i64;
