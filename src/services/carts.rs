use crate::{
    entities::{cart, cart_item, Cart, CartItem, CartModel, Course},
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, ModelTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Shopping cart service.
///
/// Carts hold course lines with price and currency snapshotted at add time.
/// A cart accepts lines in any currency for display; the single-currency
/// checkout policy is enforced when totals are computed and when the
/// preference is built, never at add time. The service never talks to the
/// payment gateway.
///
/// # Examples
///
/// ```ignore
/// use courseloft_api::services::carts::{AddToCartInput, CartService, CreateCartInput};
///
/// let carts = CartService::new(db, event_sender);
/// let cart = carts.create_cart(CreateCartInput::default()).await?;
/// carts.add_item(cart.id, AddToCartInput { course_id, quantity: 1 }).await?;
/// ```
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Creates a new shopping cart for a session or an authenticated buyer.
    ///
    /// Publishes a `CartCreated` event upon success.
    #[instrument(skip(self))]
    pub async fn create_cart(&self, input: CreateCartInput) -> Result<CartModel, ServiceError> {
        let cart_id = Uuid::new_v4();

        let cart = cart::ActiveModel {
            id: Set(cart_id),
            session_id: Set(input.session_id),
            user_id: Set(input.user_id),
            status: Set(cart::CartStatus::Active),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        };

        let cart = cart.insert(&*self.db).await?;

        self.event_sender
            .send_or_log(Event::CartCreated(cart_id))
            .await;

        info!("Created cart: {}", cart_id);
        Ok(cart)
    }

    /// Adds a course to the cart, or bumps the quantity when the course is
    /// already carted.
    ///
    /// The course must exist and be published. Title, unit price and
    /// currency are snapshotted onto the line. Publishes `CartItemAdded`
    /// upon success.
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        cart_id: Uuid,
        input: AddToCartInput,
    ) -> Result<CartWithItems, ServiceError> {
        if input.quantity < 1 {
            return Err(ServiceError::InvalidInput(
                "Quantity must be at least 1".to_string(),
            ));
        }

        let txn = self.db.begin().await?;

        let cart = Cart::find_by_id(cart_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

        if cart.status != cart::CartStatus::Active {
            return Err(ServiceError::InvalidOperation(
                "Cart is not active".to_string(),
            ));
        }

        let course = Course::find_by_id(input.course_id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Course {} not found", input.course_id))
            })?;

        if !course.published {
            return Err(ServiceError::InvalidOperation(
                "Course is not available for purchase".to_string(),
            ));
        }

        let existing_item = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .filter(cart_item::Column::CourseId.eq(input.course_id))
            .one(&txn)
            .await?;

        if let Some(item) = existing_item {
            let current_quantity = item.quantity;
            let mut item: cart_item::ActiveModel = item.into();
            item.quantity = Set(current_quantity + input.quantity);
            item.updated_at = Set(Utc::now());
            item.update(&txn).await?;
        } else {
            let cart_item = cart_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                cart_id: Set(cart_id),
                course_id: Set(input.course_id),
                title: Set(course.title.clone()),
                unit_price: Set(course.price),
                currency: Set(course.currency.clone()),
                quantity: Set(input.quantity),
                created_at: Set(Utc::now()),
                updated_at: Set(Utc::now()),
            };

            cart_item.insert(&txn).await?;
        }

        let mut cart_update: cart::ActiveModel = cart.into();
        cart_update.updated_at = Set(Utc::now());
        let cart = cart_update.update(&txn).await?;

        let items = cart.find_related(CartItem).all(&txn).await?;

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartItemAdded {
                cart_id,
                course_id: input.course_id,
            })
            .await;

        info!(
            "Added course {} x{} to cart {}",
            input.course_id, input.quantity, cart_id
        );
        Ok(CartWithItems { cart, items })
    }

    /// Updates the quantity of a cart line. A quantity of zero or less
    /// removes the line.
    #[instrument(skip(self))]
    pub async fn update_item_quantity(
        &self,
        cart_id: Uuid,
        item_id: Uuid,
        quantity: i32,
    ) -> Result<CartWithItems, ServiceError> {
        let txn = self.db.begin().await?;

        let item = CartItem::find_by_id(item_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart item {} not found", item_id)))?;

        if item.cart_id != cart_id {
            return Err(ServiceError::InvalidOperation(
                "Item does not belong to this cart".to_string(),
            ));
        }

        let course_id = item.course_id;
        if quantity <= 0 {
            item.delete(&txn).await?;
            self.event_sender
                .send_or_log(Event::CartItemRemoved { cart_id, course_id })
                .await;
        } else {
            let mut item: cart_item::ActiveModel = item.into();
            item.quantity = Set(quantity);
            item.updated_at = Set(Utc::now());
            item.update(&txn).await?;
        }

        let cart = self.touch_cart(&txn, cart_id).await?;
        let items = cart.find_related(CartItem).all(&txn).await?;
        txn.commit().await?;

        Ok(CartWithItems { cart, items })
    }

    /// Removes a line from the cart.
    #[instrument(skip(self))]
    pub async fn remove_item(
        &self,
        cart_id: Uuid,
        item_id: Uuid,
    ) -> Result<CartWithItems, ServiceError> {
        self.update_item_quantity(cart_id, item_id, 0).await
    }

    /// Retrieves a cart with all its lines.
    #[instrument(skip(self))]
    pub async fn get_cart(&self, cart_id: Uuid) -> Result<CartWithItems, ServiceError> {
        let cart = Cart::find_by_id(cart_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

        let items = cart.find_related(CartItem).all(&*self.db).await?;

        Ok(CartWithItems { cart, items })
    }

    /// Computes the checkout total for `currency`.
    ///
    /// Only lines priced in `currency` count toward the total; lines in any
    /// other currency are returned as excluded lines so the buyer sees
    /// exactly what is and is not being charged.
    #[instrument(skip(self))]
    pub async fn totals(&self, cart_id: Uuid, currency: &str) -> Result<CartTotals, ServiceError> {
        let CartWithItems { items, .. } = self.get_cart(cart_id).await?;
        Ok(compute_totals(&items, currency))
    }

    /// Empties the cart. Called by the buyer, or by the payment pipeline
    /// after a confirmed purchase.
    #[instrument(skip(self))]
    pub async fn clear_cart(&self, cart_id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;

        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .exec(&txn)
            .await?;

        self.touch_cart(&txn, cart_id).await?;

        txn.commit().await?;

        self.event_sender.send_or_log(Event::CartCleared(cart_id)).await;

        info!("Cleared cart: {}", cart_id);
        Ok(())
    }

    /// Marks a cart as converted after a confirmed purchase and drops its
    /// lines. Safe to call repeatedly; a cart that is already converted is
    /// left untouched.
    #[instrument(skip(self))]
    pub async fn mark_converted(&self, cart_id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;

        let cart = Cart::find_by_id(cart_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

        if cart.status == cart::CartStatus::Converted {
            txn.commit().await?;
            return Ok(());
        }

        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .exec(&txn)
            .await?;

        let mut cart: cart::ActiveModel = cart.into();
        cart.status = Set(cart::CartStatus::Converted);
        cart.updated_at = Set(Utc::now());
        cart.update(&txn).await?;

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartConverted(cart_id))
            .await;

        Ok(())
    }

    async fn touch_cart(
        &self,
        conn: &impl sea_orm::ConnectionTrait,
        cart_id: Uuid,
    ) -> Result<CartModel, ServiceError> {
        let mut cart: cart::ActiveModel = Cart::find_by_id(cart_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?
            .into();

        cart.updated_at = Set(Utc::now());
        Ok(cart.update(conn).await?)
    }
}

/// Splits cart lines into the checkout total for `currency` and the
/// excluded remainder. Pure so the exclusion policy is testable without a
/// database.
pub fn compute_totals(items: &[cart_item::Model], currency: &str) -> CartTotals {
    let mut total = Decimal::ZERO;
    let mut eligible_count = 0usize;
    let mut excluded = Vec::new();

    for item in items {
        if item.currency == currency {
            total += item.line_total();
            eligible_count += 1;
        } else {
            excluded.push(ExcludedLine {
                course_id: item.course_id,
                title: item.title.clone(),
                currency: item.currency.clone(),
                amount: item.line_total(),
            });
        }
    }

    CartTotals {
        currency: currency.to_string(),
        total,
        eligible_count,
        excluded,
    }
}

/// Input for creating a cart
#[derive(Debug, Default, Deserialize)]
pub struct CreateCartInput {
    pub session_id: Option<String>,
    pub user_id: Option<Uuid>,
}

/// Input for adding a course to a cart
#[derive(Debug, Deserialize)]
pub struct AddToCartInput {
    pub course_id: Uuid,
    #[serde(default = "default_quantity")]
    pub quantity: i32,
}

fn default_quantity() -> i32 {
    1
}

/// Cart with lines
#[derive(Debug, Serialize)]
pub struct CartWithItems {
    pub cart: CartModel,
    pub items: Vec<cart_item::Model>,
}

/// A cart line excluded from the checkout total because it is priced in a
/// different currency.
#[derive(Debug, Clone, Serialize)]
pub struct ExcludedLine {
    pub course_id: Uuid,
    pub title: String,
    pub currency: String,
    pub amount: Decimal,
}

/// Checkout totals for one currency
#[derive(Debug, Serialize)]
pub struct CartTotals {
    pub currency: String,
    pub total: Decimal,
    pub eligible_count: usize,
    pub excluded: Vec<ExcludedLine>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn line(currency: &str, unit_price: Decimal, quantity: i32) -> cart_item::Model {
        cart_item::Model {
            id: Uuid::new_v4(),
            cart_id: Uuid::new_v4(),
            course_id: Uuid::new_v4(),
            title: "Curso".to_string(),
            unit_price,
            currency: currency.to_string(),
            quantity,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn totals_sum_only_matching_currency() {
        let items = vec![line("ARS", dec!(1000), 1), line("USD", dec!(25), 1)];

        let totals = compute_totals(&items, "ARS");

        assert_eq!(totals.total, dec!(1000));
        assert_eq!(totals.eligible_count, 1);
        assert_eq!(totals.excluded.len(), 1);
        assert_eq!(totals.excluded[0].currency, "USD");
        assert_eq!(totals.excluded[0].amount, dec!(25));
    }

    #[test]
    fn totals_multiply_quantity_per_line() {
        let items = vec![line("ARS", dec!(1499.50), 2), line("ARS", dec!(500), 3)];

        let totals = compute_totals(&items, "ARS");

        assert_eq!(totals.total, dec!(4499.00));
        assert_eq!(totals.eligible_count, 2);
        assert!(totals.excluded.is_empty());
    }

    #[test]
    fn totals_of_empty_cart_are_zero() {
        let totals = compute_totals(&[], "ARS");
        assert_eq!(totals.total, Decimal::ZERO);
        assert_eq!(totals.eligible_count, 0);
        assert!(totals.excluded.is_empty());
    }

    #[test]
    fn all_foreign_lines_are_excluded() {
        let items = vec![line("USD", dec!(25), 1), line("EUR", dec!(30), 1)];

        let totals = compute_totals(&items, "ARS");

        assert_eq!(totals.total, Decimal::ZERO);
        assert_eq!(totals.eligible_count, 0);
        assert_eq!(totals.excluded.len(), 2);
    }

    #[test]
    fn line_total_is_unit_price_times_quantity() {
        let item = line("ARS", dec!(19.99), 7);
        assert_eq!(item.line_total(), dec!(139.93));
    }

    #[test]
    fn add_to_cart_input_defaults_quantity_to_one() {
        let json = r#"{"course_id": "550e8400-e29b-41d4-a716-446655440000"}"#;
        let input: AddToCartInput = serde_json::from_str(json).unwrap();
        assert_eq!(input.quantity, 1);
    }
}
